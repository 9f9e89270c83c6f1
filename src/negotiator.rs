//! Association negotiation policy
//!
//! Decides whether an association request is acceptable and which of its
//! presentation contexts are accepted. The server peeks the A-ASSOCIATE-RQ,
//! negotiates, and either answers with the A-ASSOCIATE-RJ from
//! [`NegotiationOutcome::wire_rejection`] or hands the accepted contexts to
//! the upper layer.

use dimse::scp::{AssociationRequest, RejectReason as WireRejectReason};
use dimse::types::uids;

use crate::policy::PolicyStore;

/// Presentation context as proposed by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// An A-ASSOCIATE-RQ as seen by the negotiator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationProposal {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<ProposedContext>,
}

impl From<AssociationRequest> for AssociationProposal {
    fn from(request: AssociationRequest) -> Self {
        Self {
            calling_ae_title: request.calling_ae_title,
            called_ae_title: request.called_ae_title,
            application_context_name: request.application_context_name,
            presentation_contexts: request
                .presentation_contexts
                .into_iter()
                .map(|pc| ProposedContext {
                    id: pc.id,
                    abstract_syntax: pc.abstract_syntax,
                    transfer_syntaxes: pc.transfer_syntaxes,
                })
                .collect(),
        }
    }
}

/// An accepted presentation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Application context name is not the DICOM one
    BadApplicationContext,
    /// No printer answers to the called AE title
    CalledAeTitleNotRecognized,
    /// None of the proposed presentation contexts is supported
    NoAcceptableContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    Accepted(Vec<NegotiatedContext>),
    Rejected(RejectReason),
    /// The server is stopping; the request is refused without further checks
    ServerShuttingDown,
}

impl NegotiationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, NegotiationOutcome::Accepted(_))
    }

    /// `Some(true)` when rejected for a bad application context,
    /// `Some(false)` for any other refusal, `None` when accepted
    pub fn rejected_bad_context(&self) -> Option<bool> {
        match self {
            NegotiationOutcome::Accepted(_) => None,
            NegotiationOutcome::Rejected(reason) => {
                Some(*reason == RejectReason::BadApplicationContext)
            }
            NegotiationOutcome::ServerShuttingDown => Some(false),
        }
    }

    /// A-ASSOCIATE-RJ result (transient?) and reason for a refusal
    pub fn wire_rejection(&self) -> Option<(bool, WireRejectReason)> {
        match self {
            NegotiationOutcome::Accepted(_) => None,
            NegotiationOutcome::Rejected(RejectReason::BadApplicationContext) => {
                Some((false, WireRejectReason::ApplicationContextNotSupported))
            }
            NegotiationOutcome::Rejected(RejectReason::CalledAeTitleNotRecognized) => {
                Some((false, WireRejectReason::CalledAeTitleNotRecognized))
            }
            NegotiationOutcome::Rejected(RejectReason::NoAcceptableContext) => {
                Some((false, WireRejectReason::NoReasonGiven))
            }
            NegotiationOutcome::ServerShuttingDown => Some((true, WireRejectReason::NoReasonGiven)),
        }
    }
}

/// Abstract syntaxes the print SCP serves
pub fn supported_abstract_syntaxes() -> &'static [&'static str] {
    &[
        uids::BASIC_GRAYSCALE_PRINT_META,
        uids::PRESENTATION_LUT,
        uids::VERIFICATION,
    ]
}

/// Transfer syntaxes the print SCP accepts, in order of preference
pub fn supported_transfer_syntaxes() -> &'static [&'static str] {
    uids::UNCOMPRESSED_TRANSFER_SYNTAXES
}

fn clean_uid(uid: &str) -> &str {
    uid.trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
}

/// Negotiate an association request against the printer policies
pub fn negotiate(
    proposal: &AssociationProposal,
    store: &dyn PolicyStore,
    shutting_down: bool,
) -> NegotiationOutcome {
    if shutting_down {
        return NegotiationOutcome::ServerShuttingDown;
    }
    if clean_uid(&proposal.application_context_name) != uids::APPLICATION_CONTEXT {
        return NegotiationOutcome::Rejected(RejectReason::BadApplicationContext);
    }
    if store.lookup(&proposal.called_ae_title).is_none() {
        return NegotiationOutcome::Rejected(RejectReason::CalledAeTitleNotRecognized);
    }

    let accepted: Vec<NegotiatedContext> = proposal
        .presentation_contexts
        .iter()
        .filter_map(|pc| {
            let abstract_syntax = clean_uid(&pc.abstract_syntax);
            if !supported_abstract_syntaxes().contains(&abstract_syntax) {
                return None;
            }
            // the first proposed syntax we support wins
            let transfer_syntax = pc
                .transfer_syntaxes
                .iter()
                .map(|ts| clean_uid(ts))
                .find(|ts| supported_transfer_syntaxes().contains(ts))?;
            Some(NegotiatedContext {
                id: pc.id,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntax: transfer_syntax.to_string(),
            })
        })
        .collect();

    if accepted.is_empty() {
        NegotiationOutcome::Rejected(RejectReason::NoAcceptableContext)
    } else {
        NegotiationOutcome::Accepted(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ConfigPolicyStore, PrinterPolicy};

    const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

    fn store() -> ConfigPolicyStore {
        ConfigPolicyStore::new(vec![PrinterPolicy::new("PRINTSCP")])
    }

    fn proposal(contexts: Vec<ProposedContext>) -> AssociationProposal {
        AssociationProposal {
            calling_ae_title: "MODALITY".into(),
            called_ae_title: "PRINTSCP".into(),
            application_context_name: uids::APPLICATION_CONTEXT.into(),
            presentation_contexts: contexts,
        }
    }

    fn context(id: u8, abstract_syntax: &str, transfer_syntaxes: &[&str]) -> ProposedContext {
        ProposedContext {
            id,
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes: transfer_syntaxes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_accepts_print_contexts_only() {
        let rq = proposal(vec![
            context(1, uids::BASIC_GRAYSCALE_PRINT_META, &[JPEG_BASELINE, uids::IMPLICIT_VR_LE]),
            context(3, uids::PRESENTATION_LUT, &[uids::EXPLICIT_VR_LE]),
            context(5, uids::SECONDARY_CAPTURE, &[uids::EXPLICIT_VR_LE]),
            context(7, uids::VERIFICATION, &[JPEG_BASELINE]),
        ]);

        match negotiate(&rq, &store(), false) {
            NegotiationOutcome::Accepted(contexts) => {
                assert_eq!(contexts.len(), 2);
                assert_eq!(contexts[0].id, 1);
                assert_eq!(contexts[0].transfer_syntax, uids::IMPLICIT_VR_LE);
                assert_eq!(contexts[1].abstract_syntax, uids::PRESENTATION_LUT);
            }
            other => panic!("Expected acceptance, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_application_context() {
        let mut rq = proposal(vec![context(1, uids::BASIC_GRAYSCALE_PRINT_META, &[uids::IMPLICIT_VR_LE])]);
        rq.application_context_name = "1.2.3.4".into();

        let outcome = negotiate(&rq, &store(), false);
        assert_eq!(outcome, NegotiationOutcome::Rejected(RejectReason::BadApplicationContext));
        assert_eq!(outcome.rejected_bad_context(), Some(true));
        assert_eq!(
            outcome.wire_rejection(),
            Some((false, WireRejectReason::ApplicationContextNotSupported))
        );
    }

    #[test]
    fn test_shutdown_wins_over_everything() {
        let mut rq = proposal(vec![]);
        rq.application_context_name = "1.2.3.4".into();
        rq.called_ae_title = "NOBODY".into();

        let outcome = negotiate(&rq, &store(), true);
        assert_eq!(outcome, NegotiationOutcome::ServerShuttingDown);
        assert_eq!(outcome.rejected_bad_context(), Some(false));
        assert_eq!(outcome.wire_rejection(), Some((true, WireRejectReason::NoReasonGiven)));

        let valid = proposal(vec![context(1, uids::BASIC_GRAYSCALE_PRINT_META, &[uids::IMPLICIT_VR_LE])]);
        assert_eq!(negotiate(&valid, &store(), true).rejected_bad_context(), Some(false));
    }

    #[test]
    fn test_unknown_printer_and_empty_contexts() {
        let mut rq = proposal(vec![context(1, uids::BASIC_GRAYSCALE_PRINT_META, &[uids::IMPLICIT_VR_LE])]);
        rq.called_ae_title = "OTHER".into();
        assert_eq!(
            negotiate(&rq, &store(), false),
            NegotiationOutcome::Rejected(RejectReason::CalledAeTitleNotRecognized)
        );

        let rq = proposal(vec![context(1, uids::SECONDARY_CAPTURE, &[uids::IMPLICIT_VR_LE])]);
        let outcome = negotiate(&rq, &store(), false);
        assert_eq!(outcome, NegotiationOutcome::Rejected(RejectReason::NoAcceptableContext));
        assert_eq!(outcome.rejected_bad_context(), Some(false));
    }

    #[test]
    fn test_padded_uids_are_accepted() {
        let rq = AssociationProposal {
            application_context_name: format!("{}\0", uids::APPLICATION_CONTEXT),
            ..proposal(vec![context(
                1,
                &format!("{}\0", uids::VERIFICATION),
                &[format!("{}\0", uids::IMPLICIT_VR_LE).as_str()],
            )])
        };
        assert!(negotiate(&rq, &store(), false).is_accepted());
    }
}
