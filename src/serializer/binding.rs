use std::{
    fmt::Debug,
    sync::Arc,
};

use anyhow::Result;
use thiserror::Error;

use crate::serializer::serializer::{
    Serializer,
    SerializerType,
    new_serializer,
};

/// Error for registering a binding under a subprotocol name that is already taken.
#[derive(Debug, Error)]
#[error("a binding for subprotocol {subprotocol} is already registered")]
pub struct DuplicateBinding {
    subprotocol: String,
}

/// A pairing of a subprotocol name with a serializer and its framing.
///
/// Transports report the subprotocol selected for each connection; the binding determines how
/// messages on that connection are framed (text or binary) and encoded.
#[derive(Clone)]
pub struct Binding {
    subprotocol: String,
    binary: bool,
    new_serializer: Arc<dyn Fn() -> Box<dyn Serializer> + Send + Sync>,
}

impl Binding {
    /// Creates a new binding.
    pub fn new<S, F>(subprotocol: S, binary: bool, new_serializer: F) -> Self
    where
        S: Into<String>,
        F: Fn() -> Box<dyn Serializer> + Send + Sync + 'static,
    {
        Self {
            subprotocol: subprotocol.into(),
            binary,
            new_serializer: Arc::new(new_serializer),
        }
    }

    /// The binding for a built-in serializer type.
    pub fn for_serializer_type(serializer_type: SerializerType) -> Self {
        Self::new(
            serializer_type.subprotocol(),
            serializer_type.binary(),
            move || new_serializer(serializer_type),
        )
    }

    /// The subprotocol name negotiated for the binding.
    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    /// Whether connections under this binding carry binary frames.
    pub fn binary(&self) -> bool {
        self.binary
    }

    /// Creates a serializer for one connection under this binding.
    pub fn new_serializer(&self) -> Box<dyn Serializer> {
        (self.new_serializer)()
    }
}

impl Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("subprotocol", &self.subprotocol)
            .field("binary", &self.binary)
            .finish()
    }
}

/// The set of bindings a router accepts connections with.
///
/// Bindings are registered before the router starts. Each subprotocol name may be registered at
/// most once.
#[derive(Debug, Clone)]
pub struct BindingRegistry {
    bindings: Vec<Binding>,
}

impl BindingRegistry {
    /// An empty registry, with no bindings at all.
    pub fn empty() -> Self {
        Self {
            bindings: Vec::default(),
        }
    }

    /// Registers a binding.
    ///
    /// Fails if a binding with the same subprotocol name is already registered.
    pub fn register(&mut self, binding: Binding) -> Result<()> {
        if self.get(binding.subprotocol()).is_some() {
            return Err(DuplicateBinding {
                subprotocol: binding.subprotocol().to_owned(),
            }
            .into());
        }
        self.bindings.push(binding);
        Ok(())
    }

    /// Looks up the binding for a subprotocol name.
    pub fn get(&self, subprotocol: &str) -> Option<&Binding> {
        self.bindings
            .iter()
            .find(|binding| binding.subprotocol() == subprotocol)
    }

    /// All registered subprotocol names, in registration order.
    pub fn subprotocols(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|binding| binding.subprotocol())
    }
}

impl Default for BindingRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(Binding::for_serializer_type(SerializerType::Json))
            .expect("empty registry accepts the json binding");
        registry
            .register(Binding::for_serializer_type(SerializerType::MessagePack))
            .expect("empty registry accepts the msgpack binding");
        registry
    }
}

#[cfg(test)]
mod binding_test {
    use crate::serializer::{
        binding::{
            Binding,
            BindingRegistry,
        },
        serializer::{
            SerializerType,
            new_serializer,
        },
    };

    #[test]
    fn default_registry_contains_standard_bindings() {
        let registry = BindingRegistry::default();
        assert_eq!(
            registry.subprotocols().collect::<Vec<_>>(),
            ["wamp.2.json", "wamp.2.msgpack"]
        );
        assert_matches::assert_matches!(registry.get("wamp.2.json"), Some(binding) => {
            assert!(!binding.binary());
        });
        assert_matches::assert_matches!(registry.get("wamp.2.msgpack"), Some(binding) => {
            assert!(binding.binary());
        });
        assert_matches::assert_matches!(registry.get("wamp.2.cbor"), None);
    }

    #[test]
    fn rejects_duplicate_subprotocols() {
        let mut registry = BindingRegistry::default();
        assert_matches::assert_matches!(
            registry.register(Binding::for_serializer_type(SerializerType::Json)),
            Err(err) => {
                assert!(err.to_string().contains("wamp.2.json is already registered"));
            }
        );
    }

    #[test]
    fn custom_bindings_may_be_registered() {
        let mut registry = BindingRegistry::empty();
        assert_matches::assert_matches!(
            registry.register(Binding::new("wamp.2.json.custom", false, || {
                new_serializer(SerializerType::Json)
            })),
            Ok(())
        );
        assert_matches::assert_matches!(registry.get("wamp.2.json.custom"), Some(_));
    }
}
