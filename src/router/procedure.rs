use anyhow::Result;

use crate::{
    core::{
        error::{
            BasicError,
            InteractionError,
        },
        hash::HashMap,
        id::Id,
        match_style::{
            MatchStyle,
            pattern_matches_uri,
            patterns_overlap,
            validate_pattern,
        },
        roles::RouterRole,
        uri::{
            Uri,
            WildcardUri,
        },
    },
    router::context::RealmContext,
};

/// A procedure that can be invoked by peers to perform some operation on the callee.
#[derive(Debug)]
pub struct Procedure {
    /// The ID of the registration.
    pub registration_id: Id,
    /// The session ID of the callee.
    pub callee: Id,

    active: bool,
}

/// A manager for all procedures owned by a realm.
///
/// At most one live registration exists per exact procedure URI. Registrations of the same match
/// style must not overlap; registrations of different match styles may, with call resolution
/// preferring exact over prefix over wildcard.
#[derive(Default)]
pub struct ProcedureManager {
    procedures: HashMap<(WildcardUri, MatchStyle), Procedure>,
}

impl ProcedureManager {
    fn conflicts(&self, procedure: &WildcardUri, match_style: MatchStyle) -> bool {
        self.procedures.iter().any(|((uri, style), _)| {
            *style == match_style && patterns_overlap(match_style, uri, procedure)
        })
    }

    /// The registration that should receive a call for the given URI.
    ///
    /// Exact registrations win over prefix registrations, which win over wildcard registrations.
    /// Ties within one match style resolve to the lowest registration ID.
    pub fn match_procedure(&self, uri: &Uri) -> Option<(&WildcardUri, &Procedure)> {
        for match_style in [MatchStyle::Exact, MatchStyle::Prefix, MatchStyle::Wildcard] {
            let matched = self
                .procedures
                .iter()
                .filter(|((pattern, style), procedure)| {
                    procedure.active
                        && *style == match_style
                        && pattern_matches_uri(pattern, match_style, uri)
                })
                .min_by_key(|(_, procedure)| procedure.registration_id)
                .map(|((pattern, _), procedure)| (pattern, procedure));
            if let Some(matched) = matched {
                return Some(matched);
            }
        }
        None
    }

    /// Removes a registration.
    pub(crate) fn remove(&mut self, procedure: &WildcardUri, match_style: MatchStyle) {
        self.procedures
            .remove(&(procedure.clone(), match_style));
    }

    /// Registers a procedure.
    pub async fn register<S>(
        context: &RealmContext<S>,
        session: Id,
        procedure: WildcardUri,
        match_style: MatchStyle,
    ) -> Result<Id> {
        if !context.router().config().roles.contains(&RouterRole::Dealer) {
            return Err(BasicError::NotAllowed("router is not a dealer".to_owned()).into());
        }
        if validate_pattern(&procedure, match_style).is_err() {
            return Err(InteractionError::InvalidUri.into());
        }

        context
            .router()
            .rpc_policies()
            .validate_registration(context, session, &procedure)
            .await?;

        let registration_id = context.router().id_allocator().generate_id().await?;
        let mut realm = context.lock().await;
        if realm.procedure_manager.conflicts(&procedure, match_style) {
            return Err(InteractionError::ProcedureAlreadyExists.into());
        }
        realm.procedure_manager.procedures.insert(
            (procedure, match_style),
            Procedure {
                registration_id,
                callee: session,
                active: false,
            },
        );
        Ok(registration_id)
    }

    /// Activates a callee's procedure.
    ///
    /// Required for proper ordering of messages. The procedure must not receive invocations until
    /// after the peer has received the registration confirmation.
    pub async fn activate_procedure<S>(
        context: &RealmContext<S>,
        procedure: &WildcardUri,
        match_style: MatchStyle,
    ) {
        if let Some(procedure) = context
            .lock()
            .await
            .procedure_manager
            .procedures
            .get_mut(&(procedure.clone(), match_style))
        {
            procedure.active = true;
        }
    }

    /// Deregisters a procedure.
    ///
    /// In-flight invocations continue; no new calls are routed to the registration.
    pub async fn unregister<S>(
        context: &RealmContext<S>,
        procedure: &WildcardUri,
        match_style: MatchStyle,
    ) {
        context
            .lock()
            .await
            .procedure_manager
            .remove(procedure, match_style);
    }
}

#[cfg(test)]
mod procedure_test {
    use crate::{
        core::{
            id::Id,
            match_style::MatchStyle,
            uri::{
                Uri,
                WildcardUri,
            },
        },
        router::procedure::{
            Procedure,
            ProcedureManager,
        },
    };

    fn pattern(pattern: &str) -> WildcardUri {
        WildcardUri::try_from(pattern).unwrap()
    }

    fn manager(procedures: &[(&str, u64, MatchStyle)]) -> ProcedureManager {
        let mut manager = ProcedureManager::default();
        for (uri, registration_id, match_style) in procedures {
            manager.procedures.insert(
                (pattern(uri), *match_style),
                Procedure {
                    registration_id: Id::try_from(*registration_id).unwrap(),
                    callee: Id::try_from(100).unwrap(),
                    active: true,
                },
            );
        }
        manager
    }

    #[test]
    fn detects_conflicting_registrations() {
        let manager = manager(&[
            ("com.a.b", 1, MatchStyle::Exact),
            ("com.pre", 2, MatchStyle::Prefix),
            ("com..wild", 3, MatchStyle::Wildcard),
        ]);

        assert!(manager.conflicts(&pattern("com.a.b"), MatchStyle::Exact));
        assert!(!manager.conflicts(&pattern("com.a.c"), MatchStyle::Exact));

        assert!(manager.conflicts(&pattern("com.pre.sub"), MatchStyle::Prefix));
        assert!(!manager.conflicts(&pattern("com.other"), MatchStyle::Prefix));

        assert!(manager.conflicts(&pattern("com.x."), MatchStyle::Wildcard));
        assert!(!manager.conflicts(&pattern("com..other"), MatchStyle::Wildcard));

        // Overlap across match styles is allowed; precedence resolves it.
        assert!(!manager.conflicts(&pattern("com.a.b"), MatchStyle::Prefix));
    }

    #[test]
    fn resolves_calls_by_style_precedence() {
        let manager = manager(&[
            ("com.a.b", 1, MatchStyle::Exact),
            ("com.a", 2, MatchStyle::Prefix),
            ("com..b", 3, MatchStyle::Wildcard),
        ]);

        assert_matches::assert_matches!(
            manager.match_procedure(&Uri::try_from("com.a.b").unwrap()),
            Some((_, procedure)) => {
                assert_eq!(procedure.registration_id, Id::try_from(1).unwrap());
            }
        );
        assert_matches::assert_matches!(
            manager.match_procedure(&Uri::try_from("com.a.z").unwrap()),
            Some((_, procedure)) => {
                assert_eq!(procedure.registration_id, Id::try_from(2).unwrap());
            }
        );
        assert_matches::assert_matches!(
            manager.match_procedure(&Uri::try_from("com.x.b").unwrap()),
            Some((_, procedure)) => {
                assert_eq!(procedure.registration_id, Id::try_from(3).unwrap());
            }
        );
        assert_matches::assert_matches!(
            manager.match_procedure(&Uri::try_from("net.other").unwrap()),
            None
        );
    }

    #[test]
    fn same_uri_may_register_under_different_styles() {
        let manager = manager(&[("com.a", 1, MatchStyle::Exact)]);
        assert!(!manager.conflicts(&pattern("com.a"), MatchStyle::Prefix));
        assert!(manager.conflicts(&pattern("com.a"), MatchStyle::Exact));
    }

    #[test]
    fn inactive_registrations_do_not_receive_calls() {
        let mut manager = manager(&[("com.a", 1, MatchStyle::Exact)]);
        manager
            .procedures
            .get_mut(&(pattern("com.a"), MatchStyle::Exact))
            .unwrap()
            .active = false;
        assert_matches::assert_matches!(
            manager.match_procedure(&Uri::try_from("com.a").unwrap()),
            None
        );
    }
}
