//! Emergency message composition.
//!
//! Builds the family and ambulance SMS bodies for an alert cycle. The
//! external generator is tried with retry and exponential backoff; when it
//! is unavailable or keeps failing, a deterministic template is used. The
//! template path cannot fail, so an alert always has something to send.

pub mod generator;
pub mod sms;

use std::sync::Arc;
use std::time::Duration;
use serde::Deserialize;
use tracing::{info, warn};

use crate::types::{
    AlertMessages, EmergencyContacts, KineticSnapshot, MessageSource, Position, Profile,
    TriggerReason,
};
use generator::{alert_messages_schema, GenerationError, GenerationRequest, TextGenerator};

/// Upper bound for a single SMS body (characters)
pub const MAX_SMS_CHARS: usize = 160;

pub const LOCATION_UNAVAILABLE: &str = "Location unavailable (GPS error)";

/// Retry schedule for the generation call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_backoff: Duration,
    /// Backoff growth factor per failed attempt
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): 1s, 2s, 4s, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        self.initial_backoff * self.multiplier.saturating_pow(exp)
    }
}

/// Everything the messages are built from
#[derive(Debug, Clone)]
pub struct AlertRequest {
    pub profile: Profile,
    pub position: Option<Position>,
    pub contacts: EmergencyContacts,
    pub reason: TriggerReason,
    pub snapshot: KineticSnapshot,
}

/// A composed message pair
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedAlert {
    pub messages: AlertMessages,
    pub source: MessageSource,
    /// Generation attempts made (0 when offline)
    pub attempts: u32,
}

pub struct MessageDispatcher {
    generator: Option<Arc<dyn TextGenerator>>,
    retry: RetryPolicy,
}

impl MessageDispatcher {
    pub fn new(generator: Arc<dyn TextGenerator>, retry: RetryPolicy) -> Self {
        Self {
            generator: Some(generator),
            retry,
        }
    }

    /// Dispatcher without a generation backend; always uses the template
    pub fn offline() -> Self {
        Self {
            generator: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.generator.is_some()
    }

    /// Compose both messages. Always completes with a usable pair.
    pub async fn compose(&self, request: &AlertRequest) -> ComposedAlert {
        let Some(generator) = &self.generator else {
            return ComposedAlert {
                messages: fallback_messages(request),
                source: MessageSource::Fallback,
                attempts: 0,
            };
        };

        let generation = GenerationRequest {
            prompt: build_prompt(request),
            schema: alert_messages_schema(),
        };
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let result = generator
                .generate(&generation)
                .await
                .and_then(|text| parse_messages(&text));

            match result {
                Ok(messages) => {
                    info!("🤖 Messages generated on attempt {}/{}", attempt, max_attempts);
                    return ComposedAlert {
                        messages,
                        source: MessageSource::Generated,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    warn!("⚠️  Generation attempt {}/{} failed: {}", attempt, max_attempts, e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.backoff(attempt)).await;
                    }
                }
            }
        }

        warn!("Generation exhausted, using fallback template");
        ComposedAlert {
            messages: fallback_messages(request),
            source: MessageSource::Fallback,
            attempts: max_attempts,
        }
    }
}

/// Google Maps link for a fix
pub fn map_link(position: &Position) -> String {
    format!(
        "https://www.google.com/maps?q={:.6},{:.6}",
        position.latitude, position.longitude
    )
}

fn location_text(position: Option<&Position>) -> String {
    position
        .map(map_link)
        .unwrap_or_else(|| LOCATION_UNAVAILABLE.to_string())
}

fn axis_stats(s: &KineticSnapshot) -> String {
    format!("x {:.2}, y {:.2}, z {:.2}", s.gx, s.gy, s.gz)
}

/// Prompt for the generation backend
pub fn build_prompt(request: &AlertRequest) -> String {
    let p = &request.profile;
    let s = &request.snapshot;
    let location = match &request.position {
        Some(pos) => format!(
            "Latitude: {}, Longitude: {}. Google Maps: {}",
            pos.latitude,
            pos.longitude,
            map_link(pos)
        ),
        None => LOCATION_UNAVAILABLE.to_string(),
    };
    let event = match request.reason {
        TriggerReason::Impact => "a high-impact collision detected by the accelerometer",
        TriggerReason::Movement => "the parked vehicle moving away unexpectedly (possible towing or theft)",
    };

    format!(
        "Generate two distinct, professional emergency SMS messages for {event}.\n\
         \n\
         USER DETAILS:\n\
         Name: {name}\n\
         Age: {age}\n\
         Blood Group: {blood}\n\
         Vehicle: {vehicle}\n\
         Mobile: {mobile}\n\
         Location: {location}\n\
         \n\
         TRIGGER: {reason}\n\
         KINETIC STATS: X: {gx:.2}g, Y: {gy:.2}g, Z: {gz:.2}g, Total: {total:.2}g\n\
         \n\
         SERVICES:\n\
         Ambulance Contact: {ambulance}\n\
         \n\
         REQUIREMENTS:\n\
         1. Message for Family: inform them of the incident, give the location link and the ambulance number.\n\
         2. Message for Ambulance: give age, blood group, vehicle number, kinetic stats and the precise location.\n\
         3. Each message must be at most {max} characters.\n\
         4. Respond with JSON containing exactly the string fields \"family\" and \"ambulance\".",
        event = event,
        name = p.name,
        age = p.age,
        blood = p.blood_group,
        vehicle = p.vehicle_number,
        mobile = p.mobile,
        location = location,
        reason = request.reason,
        gx = s.gx,
        gy = s.gy,
        gz = s.gz,
        total = s.total,
        ambulance = request.contacts.ambulance,
        max = MAX_SMS_CHARS,
    )
}

#[derive(Deserialize)]
struct RawMessages {
    family: String,
    ambulance: String,
}

/// Remove a surrounding markdown code fence if the model added one
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parse and validate a generator response
pub fn parse_messages(text: &str) -> Result<AlertMessages, GenerationError> {
    let body = strip_code_fence(text);
    if body.is_empty() {
        return Err(GenerationError::EmptyResponse);
    }

    let raw: RawMessages =
        serde_json::from_str(body).map_err(|e| GenerationError::Malformed(e.to_string()))?;

    let family = raw.family.trim().to_string();
    let ambulance = raw.ambulance.trim().to_string();
    for (field, value) in [("family", &family), ("ambulance", &ambulance)] {
        if value.is_empty() {
            return Err(GenerationError::Schema(format!("{} is empty", field)));
        }
        let len = value.chars().count();
        if len > MAX_SMS_CHARS {
            return Err(GenerationError::Schema(format!("{} is {} chars", field, len)));
        }
    }

    Ok(AlertMessages { family, ambulance })
}

/// First candidate that fits, else the last one cut to the limit
fn fit_sms(candidates: &[String]) -> String {
    for candidate in candidates {
        if candidate.chars().count() <= MAX_SMS_CHARS {
            return candidate.clone();
        }
    }
    let last = candidates.last().map(String::as_str).unwrap_or_default();
    let mut cut: String = last.chars().take(MAX_SMS_CHARS - 1).collect();
    cut.push('…');
    cut
}

/// Template messages. Deterministic for a given request.
pub fn fallback_messages(request: &AlertRequest) -> AlertMessages {
    let p = &request.profile;
    let s = &request.snapshot;
    let loc = location_text(request.position.as_ref());
    let ems = &request.contacts.ambulance;

    let family = match request.reason {
        TriggerReason::Impact => vec![
            format!(
                "EMERGENCY: Accident detected for {}. Impact {:.2}g ({}). Location: {}. Ambulance: {}",
                p.name, s.total, axis_stats(s), loc, ems
            ),
            format!(
                "EMERGENCY: Accident for {}, {:.2}g. Ambulance: {}. Loc: {}",
                p.name, s.total, ems, loc
            ),
        ],
        TriggerReason::Movement => vec![
            format!(
                "ALERT: {}'s vehicle {} moved unexpectedly ({:.2}g). Location: {}. Ambulance: {}",
                p.name, p.vehicle_number, s.total, loc, ems
            ),
            format!(
                "ALERT: {}'s vehicle {} moved. Ambulance: {}. Loc: {}",
                p.name, p.vehicle_number, ems, loc
            ),
        ],
    };

    let event = match request.reason {
        TriggerReason::Impact => "Accident",
        TriggerReason::Movement => "Vehicle moved",
    };
    let home = if p.address.trim().is_empty() {
        String::new()
    } else {
        format!(" Home: {}.", p.address.trim())
    };
    let ambulance = vec![
        format!(
            "URGENT: {} for {} (Age {}, Blood {}, Vehicle {}). {:.2}g ({}). Loc: {}.{} EMS: {}",
            event, p.name, p.age, p.blood_group, p.vehicle_number, s.total, axis_stats(s), loc, home, ems
        ),
        format!(
            "URGENT: {} for {}. Age {}, Blood {}, Vehicle {}. EMS: {}. {:.2}g. Loc: {}",
            event, p.name, p.age, p.blood_group, p.vehicle_number, ems, s.total, loc
        ),
    ];

    AlertMessages {
        family: fit_sms(&family),
        ambulance: fit_sms(&ambulance),
    }
}
