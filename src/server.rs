//! TCP listeners and per-association tasks
//!
//! Every printer listens on its own port. Each accepted connection gets an
//! association task: the negotiator decides on the peeked A-ASSOCIATE-RQ,
//! refusals are answered with an A-ASSOCIATE-RJ, and accepted associations
//! are served by a [`PrintScp`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dimse::scp::{peek_association_request, reject_association, RejectReason};
use dimse::{ScpAssociation, ScpOptions, DEFAULT_TIMEOUT_SECS};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::ServerConfig;
use crate::engine::PrintScp;
use crate::enricher::{PixelDataDecoder, TagEnricher, TesseractRecognizer};
use crate::negotiator::{self, supported_transfer_syntaxes, AssociationProposal, NegotiationOutcome};
use crate::policy::{PolicyStore, PrinterPolicy};
use crate::relay::{DimseRelay, NoUpstream, RelayLocks, UpstreamRelay};

/// State shared by all listeners
struct ServerContext {
    store: Arc<dyn PolicyStore>,
    locks: RelayLocks,
    max_pdu: u32,
    strict_pdu: bool,
    shutdown: CancellationToken,
}

/// Listen for every printer of `store` until `shutdown` is cancelled
pub async fn serve(
    settings: &ServerConfig,
    store: Arc<dyn PolicyStore>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let printers = store.printers();
    let context = Arc::new(ServerContext {
        store,
        locks: RelayLocks::new(),
        max_pdu: settings.max_pdu,
        strict_pdu: settings.strict_pdu,
        shutdown,
    });

    let mut listeners = JoinSet::new();
    for policy in printers {
        let listener = bind(settings.bind_address, &policy).await?;
        listeners.spawn(accept_loop(listener, policy, context.clone()));
    }

    while let Some(result) = listeners.join_next().await {
        if let Err(e) = result {
            error!("Listener task failed: {}", e);
        }
    }
    info!("All listeners stopped");
    Ok(())
}

async fn bind(address: IpAddr, policy: &PrinterPolicy) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::new(address, policy.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} for printer {}", addr, policy.ae_title))?;
    info!("🖨️  Printer {} listening on {}", policy.ae_title, addr);
    Ok(listener)
}

async fn accept_loop(listener: TcpListener, policy: Arc<PrinterPolicy>, context: Arc<ServerContext>) {
    let mut associations = JoinSet::new();

    loop {
        tokio::select! {
            _ = context.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let span = info_span!(
                        "association",
                        printer = %policy.ae_title,
                        %peer,
                        id = %uuid::Uuid::new_v4()
                    );
                    let policy = policy.clone();
                    let context = context.clone();
                    associations.spawn(
                        async move {
                            if let Err(e) = handle_connection(stream, policy, context).await {
                                warn!("Association failed: {:#}", e);
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => error!("Failed to accept connection for {}: {}", policy.ae_title, e),
            },
            // reap finished associations
            Some(_) = associations.join_next(), if !associations.is_empty() => {}
        }
    }

    info!("Listener for {} stopped, waiting for {} associations", policy.ae_title, associations.len());
    while associations.join_next().await.is_some() {}
}

async fn handle_connection(
    stream: TcpStream,
    policy: Arc<PrinterPolicy>,
    context: Arc<ServerContext>,
) -> anyhow::Result<()> {
    let timeout = policy
        .receive_timeout
        .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));

    let request = peek_association_request(&stream, timeout).await?;
    let proposal = AssociationProposal::from(request);
    let mut outcome = negotiator::negotiate(&proposal, context.store.as_ref(), context.shutdown.is_cancelled());
    if outcome.is_accepted() && proposal.called_ae_title != policy.ae_title {
        // another printer of the store, but not the one on this port
        outcome = NegotiationOutcome::Rejected(negotiator::RejectReason::CalledAeTitleNotRecognized);
    }

    let contexts = match outcome {
        NegotiationOutcome::Accepted(contexts) => contexts,
        refused => {
            info!("Refusing association from {}: {:?}", proposal.calling_ae_title, refused);
            let (transient, reason) = refused
                .wire_rejection()
                .unwrap_or((false, RejectReason::NoReasonGiven));
            reject_association(stream, transient, reason, timeout).await?;
            return Ok(());
        }
    };

    let mut abstract_syntaxes: Vec<String> = Vec::new();
    for pc in &contexts {
        if !abstract_syntaxes.contains(&pc.abstract_syntax) {
            abstract_syntaxes.push(pc.abstract_syntax.clone());
        }
    }
    let options = ScpOptions {
        ae_title: policy.ae_title.clone(),
        abstract_syntaxes,
        transfer_syntaxes: supported_transfer_syntaxes().iter().map(|s| s.to_string()).collect(),
        max_pdu: context.max_pdu,
        strict: context.strict_pdu,
        receive_timeout: policy.receive_timeout,
    };
    let mut association = ScpAssociation::accept(stream, &options).await?;
    info!(
        "Accepted association from {} ({} presentation contexts)",
        proposal.calling_ae_title,
        association.accepted_contexts().len()
    );

    let cancel = context.shutdown.child_token();
    let relay: Box<dyn UpstreamRelay> = match &policy.upstream {
        Some(node) => Box::new(DimseRelay::new(
            policy.ae_title.clone(),
            node.clone(),
            &context.locks,
            cancel.clone(),
            context.max_pdu,
            timeout,
        )),
        None => Box::new(NoUpstream),
    };
    let enricher = Arc::new(TagEnricher::new(
        Arc::new(TesseractRecognizer::new(policy.recognizer_command.clone(), timeout)),
        Arc::new(PixelDataDecoder),
    ));

    let mut scp = PrintScp::new(policy, relay, enricher, cancel);
    let termination = scp.serve(&mut association).await?;
    info!("Association ended: {:?}", termination);
    Ok(())
}
