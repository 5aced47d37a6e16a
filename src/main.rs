//! LifeGuard Node
//!
//! Vehicle accident detection and emergency dispatch.
//!
//! Usage:
//!   lifeguard-node [OPTIONS]
//!
//! Options:
//!   --port <PORT>         API port (default: 8080)
//!   --threshold <G>       Impact threshold in g (default: 3.5)
//!   --countdown <SECS>    Cancel window in seconds (default: 10)
//!   --ambulance <NUMBER>  Ambulance contact (default: +1-555-0199)
//!   --model <NAME>        Generation model (default: gemini-3-flash-preview)
//!   --simulate            Drive a synthetic vehicle and stage a crash
//!
//! Environment:
//!   GEMINI_API_KEY        Enables generated messages (templates otherwise)
//!   RUST_LOG              Log filter (default: info)

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lifeguard_node::{
    api::{self, AppState},
    detection::DetectionConfig,
    dispatch::generator::{GeminiGenerator, DEFAULT_MODEL},
    dispatch::sms::LogMessenger,
    kinematics::STANDARD_GRAVITY,
    types::{AccelerationReading, EmergencyContacts, Position, Profile},
    CountdownConfig, MessageDispatcher, RetryPolicy, SessionConfig, SessionRuntime,
};

#[derive(Debug)]
struct Config {
    api_port: u16,
    gforce_threshold: f64,
    countdown_secs: u32,
    ambulance: String,
    model: String,
    simulate: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_port: 8080,
            gforce_threshold: DetectionConfig::default().gforce_threshold,
            countdown_secs: CountdownConfig::default().ticks,
            ambulance: EmergencyContacts::default().ambulance,
            model: DEFAULT_MODEL.to_string(),
            simulate: false,
        }
    }
}

fn parse_args() -> Config {
    let mut config = Config::default();
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                config.api_port = args.get(i + 1)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(8080);
                i += 1;
            }
            "--threshold" => {
                if let Some(g) = args.get(i + 1).and_then(|s| s.parse().ok()) {
                    config.gforce_threshold = g;
                }
                i += 1;
            }
            "--countdown" => {
                if let Some(secs) = args.get(i + 1).and_then(|s| s.parse().ok()) {
                    config.countdown_secs = secs;
                }
                i += 1;
            }
            "--ambulance" => {
                if let Some(number) = args.get(i + 1) {
                    config.ambulance = number.clone();
                }
                i += 1;
            }
            "--model" => {
                if let Some(model) = args.get(i + 1) {
                    config.model = model.clone();
                }
                i += 1;
            }
            "--simulate" => {
                config.simulate = true;
            }
            _ => {}
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = parse_args();

    println!(r#"
    ╔═══════════════════════════════════════════════════════════╗
    ║                                                           ║
    ║   🚑  LIFEGUARD NODE                                      ║
    ║       Accident Detection & Emergency Dispatch             ║
    ║                                                           ║
    ╚═══════════════════════════════════════════════════════════╝
    "#);

    info!("Starting LifeGuard Node...");
    info!("  API Port: {}", config.api_port);
    info!("  Impact Threshold: {:.1}g", config.gforce_threshold);
    info!("  Countdown: {}s", config.countdown_secs);
    info!("  Ambulance: {}", config.ambulance);

    let mut detection = DetectionConfig::default();
    let allowed = detection.min_gforce_threshold..=detection.max_gforce_threshold;
    if allowed.contains(&config.gforce_threshold) {
        detection.gforce_threshold = config.gforce_threshold;
    } else {
        warn!(
            "Threshold {:.1}g out of range, using {:.1}g",
            config.gforce_threshold, detection.gforce_threshold
        );
    }

    let session_config = SessionConfig {
        detection,
        countdown: CountdownConfig { ticks: config.countdown_secs.max(1) },
        contacts: EmergencyContacts { ambulance: config.ambulance.clone() },
        ..Default::default()
    };

    // Message generation backend
    let dispatcher = match std::env::var("GEMINI_API_KEY") {
        Ok(key) if !key.trim().is_empty() => {
            info!("  Messages: generated ({})", config.model);
            let generator = Arc::new(GeminiGenerator::new(key, config.model.clone()));
            MessageDispatcher::new(generator, RetryPolicy::default())
        }
        _ => {
            warn!("  Messages: GEMINI_API_KEY not set, using templates only");
            MessageDispatcher::offline()
        }
    };

    let state: AppState = SessionRuntime::new(session_config, dispatcher, Arc::new(LogMessenger));

    // Spawn location evaluation loop
    state.spawn_location_poller(state.location_feed());

    // Spawn simulation if enabled
    if config.simulate {
        let sim_state = state.clone();
        tokio::spawn(async move {
            simulate_drive(sim_state).await;
        });
    }

    // Start API server
    let addr = format!("0.0.0.0:{}", config.api_port);
    api::start_server(state, &addr).await?;

    Ok(())
}

/// Simulate a drive ending in a crash (when --simulate is passed)
async fn simulate_drive(state: AppState) {
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    info!("🎭 Starting drive simulation...");

    let profile = Profile {
        name: "Demo Driver".to_string(),
        mobile: "+1-555-0100".to_string(),
        vehicle_number: "SIM-0001".to_string(),
        age: 30,
        blood_group: "O+".to_string(),
        address: "1 Test Track".to_string(),
        emergency_contact: "+1-555-0111".to_string(),
    };
    if let Err(e) = state.register(profile).await {
        warn!("Simulation could not register: {}", e);
        return;
    }

    let mut interval = tokio::time::interval(Duration::from_millis(200));
    let mut rng = StdRng::from_entropy();
    let track = Position::new(12.9716, 77.5946);
    // ~36 km/h around a 20 m loop, inside the movement threshold
    let speed = 10.0;
    let radius_deg = 20.0 / 111_195.0;

    for step in 0u32.. {
        interval.tick().await;

        if step % 5 == 0 {
            let theta = f64::from(step) * speed * 0.2 / 20.0;
            let fix = Position::new(
                track.latitude + radius_deg * theta.cos(),
                track.longitude + radius_deg * theta.sin(),
            );
            state.push_fix(fix.with_speed(speed));
        }

        let reading = if step == 150 {
            warn!("💥 Simulated crash spike");
            AccelerationReading::new(
                rng.gen_range(2.0..4.0) * STANDARD_GRAVITY,
                rng.gen_range(4.0..6.0) * STANDARD_GRAVITY,
                STANDARD_GRAVITY,
            )
        } else {
            AccelerationReading::new(
                rng.gen_range(-0.3..0.3),
                rng.gen_range(-0.3..0.3),
                STANDARD_GRAVITY + rng.gen_range(-0.5..0.5),
            )
        };
        state.ingest_motion(reading).await;

        if step > 150 {
            // Vehicle stopped after the crash
            break;
        }
    }

    info!("🎭 Simulation finished; waiting for the driver to respond");
}
