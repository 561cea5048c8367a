use crate::{router::RouteOutcome, Envelope, RelayConfig};

/// What happens to a message once it was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The private account sent it to the outbound address, it is queued
    /// in the outbox.
    DeliverOutbound,
    /// A third party wrote to a proxy address.
    ForwardToPrivate,
    /// The private account answered a forwarded message.
    ReplyRelay,
}

/// Everything the relay will do with a message, decided up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Never delivered, the operator is told why.
    Quarantine(String),
    /// A route drops it silently.
    Drop,
    /// A suspect message matched a route that does not allow it.
    Reject(String),
    /// Topics to notify and the disposition, `None` when a matched route
    /// disabled forwarding.
    Route {
        notify: Vec<String>,
        disposition: Option<Disposition>,
    },
}

/// Decides the fate of a message. No side effects.
pub fn decide(config: &RelayConfig, envelope: &Envelope) -> RoutingDecision {
    if envelope.verdicts.virus() {
        return RoutingDecision::Quarantine("Virus email, not processing".to_string());
    }

    let from_address = envelope.from_address();
    if from_address.to_lowercase() == config.mailer_daemon {
        return RoutingDecision::Quarantine(
            "Mailer daemon notification, not forwarding".to_string(),
        );
    }

    let to_outbound = envelope
        .to_addresses()
        .iter()
        .any(|to| *to == config.outbound_address);

    match config
        .router
        .evaluate(&envelope.to, &from_address, &envelope.verdicts)
    {
        RouteOutcome::Drop => RoutingDecision::Drop,
        RouteOutcome::Reject(reason) => RoutingDecision::Reject(reason),
        RouteOutcome::Matched {
            notify,
            suppress_forward,
        } => {
            let disposition = if suppress_forward {
                None
            } else if from_address == config.private_account.address() {
                if to_outbound {
                    Some(Disposition::DeliverOutbound)
                } else {
                    Some(Disposition::ReplyRelay)
                }
            } else {
                Some(Disposition::ForwardToPrivate)
            };
            RoutingDecision::Route {
                notify,
                disposition,
            }
        }
    }
}
