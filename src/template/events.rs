//! Structured events parsed from execution logs
//!
//! Programs emit events as `Program data: <base64>` log lines whose payload
//! starts with an 8-byte tag. Registered tags decode into named buckets;
//! everything else that looks like an event lands in the `unknown` bucket.

use crate::error::{ContextError, DecodeError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::trace;

pub const PROGRAM_DATA_PREFIX: &str = "Program data: ";
pub const EVENT_TAG_LEN: usize = 8;

pub type EventTag = [u8; EVENT_TAG_LEN];

type Payload = Arc<dyn Any + Send + Sync>;
type EventDecodeFn = Arc<dyn Fn(&[u8]) -> std::result::Result<Payload, DecodeError> + Send + Sync>;

/// Registry of event decoders keyed by tag
#[derive(Clone, Default)]
pub struct EventDecoders {
    by_tag: HashMap<EventTag, (String, EventDecodeFn)>,
}

impl std::fmt::Debug for EventDecoders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.by_tag.values().map(|(name, _)| name.as_str()).collect();
        names.sort_unstable();
        f.debug_struct("EventDecoders").field("events", &names).finish()
    }
}

impl EventDecoders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder for the payload that follows `tag`
    pub fn register<E, F>(mut self, name: impl Into<String>, tag: EventTag, decode: F) -> Self
    where
        E: Send + Sync + 'static,
        F: Fn(&[u8]) -> std::result::Result<E, DecodeError> + Send + Sync + 'static,
    {
        let decode: EventDecodeFn = Arc::new(move |body| decode(body).map(|event| Arc::new(event) as Payload));
        self.by_tag.insert(tag, (name.into(), decode));
        self
    }

    /// Register a bincode-encoded event
    pub fn register_bincode<E>(self, name: impl Into<String>, tag: EventTag) -> Self
    where
        E: DeserializeOwned + Send + Sync + 'static,
    {
        self.register(name, tag, |body| {
            bincode::deserialize::<E>(body).map_err(|e| DecodeError::Malformed(e.to_string()))
        })
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// Partition event log lines into buckets
    ///
    /// A registered tag whose payload fails to decode is an error; it is
    /// never silently moved to `unknown`.
    pub fn decode_logs(&self, logs: &[String]) -> Result<EventBuckets> {
        let mut buckets = EventBuckets::default();
        for line in logs {
            let Some(encoded) = line.strip_prefix(PROGRAM_DATA_PREFIX) else {
                continue;
            };
            let encoded = encoded.trim();
            let Ok(bytes) = STANDARD.decode(encoded) else {
                buckets.unknown.push(encoded.to_string());
                continue;
            };
            if bytes.len() < EVENT_TAG_LEN {
                buckets.unknown.push(encoded.to_string());
                continue;
            }

            let (tag, body) = bytes.split_at(EVENT_TAG_LEN);
            let registered = <EventTag>::try_from(tag)
                .ok()
                .and_then(|tag| self.by_tag.get(&tag));
            match registered {
                Some((name, decode)) => {
                    let payload = decode(body).map_err(|error| ContextError::EventDecode {
                        event: name.clone(),
                        error,
                        landed: None,
                    })?;
                    trace!(event = %name, "decoded event");
                    buckets.named.entry(name.clone()).or_default().push(DecodedEvent {
                        name: name.clone(),
                        payload,
                    });
                }
                None => buckets.unknown.push(encoded.to_string()),
            }
        }
        Ok(buckets)
    }
}

/// One decoded event
#[derive(Clone)]
pub struct DecodedEvent {
    pub name: String,
    payload: Payload,
}

impl std::fmt::Debug for DecodedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedEvent").field("name", &self.name).finish_non_exhaustive()
    }
}

impl DecodedEvent {
    pub fn downcast_ref<E: 'static>(&self) -> Option<&E> {
        self.payload.downcast_ref::<E>()
    }
}

/// Events of one execution, by name, plus unrecognized entries
#[derive(Debug, Clone, Default)]
pub struct EventBuckets {
    named: BTreeMap<String, Vec<DecodedEvent>>,
    unknown: Vec<String>,
}

impl EventBuckets {
    /// Events of `name` that decode to `E`, in log order
    pub fn get<E: 'static>(&self, name: &str) -> Vec<&E> {
        self.named
            .get(name)
            .map(|events| events.iter().filter_map(|event| event.downcast_ref::<E>()).collect())
            .unwrap_or_default()
    }

    pub fn first<E: 'static>(&self, name: &str) -> Option<&E> {
        self.get::<E>(name).into_iter().next()
    }

    pub fn last<E: 'static>(&self, name: &str) -> Option<&E> {
        self.get::<E>(name).into_iter().last()
    }

    pub fn count(&self, name: &str) -> usize {
        self.named.get(name).map_or(0, Vec::len)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named.keys().map(String::as_str)
    }

    /// Base64 payloads of event entries nobody registered
    pub fn unknown(&self) -> &[String] {
        &self.unknown
    }

    pub fn total(&self) -> usize {
        self.named.values().map(Vec::len).sum::<usize>() + self.unknown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Format `tag ++ body` as an event log line
pub fn encode_event_line(tag: &EventTag, body: &[u8]) -> String {
    let mut bytes = tag.to_vec();
    bytes.extend_from_slice(body);
    format!("{}{}", PROGRAM_DATA_PREFIX, STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    const DEPOSITED: EventTag = [1, 1, 1, 1, 1, 1, 1, 1];
    const PROCESSED: EventTag = [2, 2, 2, 2, 2, 2, 2, 2];

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Deposited {
        amount: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Processed {
        next_sequence: u32,
    }

    fn decoders() -> EventDecoders {
        EventDecoders::new()
            .register_bincode::<Deposited>("deposited", DEPOSITED)
            .register_bincode::<Processed>("processed", PROCESSED)
    }

    fn line<T: Serialize>(tag: &EventTag, event: &T) -> String {
        encode_event_line(tag, &bincode::serialize(event).unwrap())
    }

    #[test]
    fn test_partition_into_buckets() {
        let logs = vec![
            "Program 11111111111111111111111111111111 invoke [1]".to_string(),
            "Program log: Instruction: Deposit".to_string(),
            line(&DEPOSITED, &Deposited { amount: 10 }),
            line(&PROCESSED, &Processed { next_sequence: 3 }),
            line(&DEPOSITED, &Deposited { amount: 20 }),
            encode_event_line(&[9; 8], &[1, 2, 3]),
            "Program data: !!not-base64!!".to_string(),
        ];

        let buckets = decoders().decode_logs(&logs).unwrap();
        let amounts: Vec<u64> = buckets.get::<Deposited>("deposited").iter().map(|d| d.amount).collect();
        assert_eq!(amounts, vec![10, 20]);
        assert_eq!(buckets.last::<Processed>("processed").unwrap().next_sequence, 3);
        assert_eq!(buckets.unknown().len(), 2);
        assert_eq!(buckets.total(), 5);
        assert_eq!(buckets.names().collect::<Vec<_>>(), vec!["deposited", "processed"]);
        assert!(buckets.get::<Processed>("deposited").is_empty());
    }

    #[test]
    fn test_registered_tag_with_bad_payload_fails() {
        let logs = vec![encode_event_line(&PROCESSED, &[1])];
        let err = decoders().decode_logs(&logs).unwrap_err();
        assert!(matches!(err, ContextError::EventDecode { ref event, .. } if event == "processed"));
    }

    proptest! {
        #[test]
        fn prop_unregistered_events_never_fail(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..40), 0..10)
        ) {
            let logs: Vec<String> = payloads
                .iter()
                .map(|bytes| format!("{}{}", PROGRAM_DATA_PREFIX, STANDARD.encode(bytes)))
                .collect();
            let buckets = EventDecoders::new().decode_logs(&logs).unwrap();
            prop_assert_eq!(buckets.unknown().len(), payloads.len());
            prop_assert_eq!(buckets.names().count(), 0);
        }
    }
}
