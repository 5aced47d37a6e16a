//! Native messaging intents.
//!
//! The node cannot send SMS itself; it hands the platform an `sms:` URI with
//! the address and pre-filled body. Fire-and-forget: no delivery report.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;
use tracing::info;

use crate::types::Recipient;

/// Characters left unescaped by `encodeURIComponent`
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SmsIntent {
    pub recipient: Recipient,
    pub to: String,
    pub body: String,
}

impl SmsIntent {
    pub fn new(recipient: Recipient, to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient,
            to: to.into(),
            body: body.into(),
        }
    }

    /// `sms:<to>?body=<encoded body>`
    pub fn uri(&self) -> String {
        let to: String = self.to.chars().filter(|c| !c.is_whitespace()).collect();
        format!("sms:{}?body={}", to, utf8_percent_encode(&self.body, URI_COMPONENT))
    }
}

/// Hands composed messages to the platform's messaging composer
pub trait Messenger: Send + Sync {
    fn send(&self, intent: &SmsIntent);
}

/// Messenger that only logs the intent (headless nodes, simulation)
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMessenger;

impl Messenger for LogMessenger {
    fn send(&self, intent: &SmsIntent) {
        info!("📱 SMS intent ({:?}) → {}", intent.recipient, intent.uri());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every intent it is given
    #[derive(Default)]
    pub struct RecordingMessenger {
        pub sent: Mutex<Vec<SmsIntent>>,
    }

    impl RecordingMessenger {
        pub fn sent(&self) -> Vec<SmsIntent> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Messenger for RecordingMessenger {
        fn send(&self, intent: &SmsIntent) {
            self.sent.lock().unwrap().push(intent.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_encoding() {
        let intent = SmsIntent::new(
            Recipient::Family,
            "+1 555 0111",
            "Help! Jane & co at https://maps?q=1,2",
        );
        assert_eq!(
            intent.uri(),
            "sms:+15550111?body=Help!%20Jane%20%26%20co%20at%20https%3A%2F%2Fmaps%3Fq%3D1%2C2"
        );
    }

    #[test]
    fn test_uri_encodes_unicode() {
        let intent = SmsIntent::new(Recipient::Ambulance, "112", "café");
        assert_eq!(intent.uri(), "sms:112?body=caf%C3%A9");
    }
}
