//! Classification of the platform authentication and content verdicts.

use crate::event::{ReceiptBlock, Verdict};

/// Per-message failure flags derived from the receipt verdicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerdictSet {
    pub dkim_failed: bool,
    pub spf_failed: bool,
    pub virus_failed: bool,
    /// Informational only, spam never changes routing.
    pub spam_failed: bool,
}

/// A failed verdict, kept for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspectReason {
    pub name: &'static str,
    pub status: String,
}

impl VerdictSet {
    /// Classifies the verdicts of a receipt, anything but `PASS` fails.
    pub fn classify(receipt: &ReceiptBlock) -> Self {
        Self {
            dkim_failed: !receipt.dkim_verdict.passed(),
            spf_failed: !receipt.spf_verdict.passed(),
            virus_failed: !receipt.virus_verdict.passed(),
            spam_failed: !receipt.spam_verdict.passed(),
        }
    }

    /// Whether the sender authentication is doubtful (DKIM or SPF failed).
    pub fn suspect(&self) -> bool {
        self.dkim_failed || self.spf_failed
    }

    /// Whether the message must never be delivered onward.
    pub fn virus(&self) -> bool {
        self.virus_failed
    }

    /// Lists every failed verdict that makes the message suspect, virus
    /// included, with the status the platform reported.
    pub fn reasons(receipt: &ReceiptBlock) -> Vec<SuspectReason> {
        let checks: [(&'static str, &Verdict); 3] = [
            ("dkim_verdict", &receipt.dkim_verdict),
            ("spf_verdict", &receipt.spf_verdict),
            ("virus_verdict", &receipt.virus_verdict),
        ];
        checks
            .into_iter()
            .filter(|(_, verdict)| !verdict.passed())
            .map(|(name, verdict)| SuspectReason {
                name,
                status: verdict.status.clone(),
            })
            .collect()
    }
}
