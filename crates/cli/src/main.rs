use clap::{Parser, Subcommand};
use std::sync::Arc;
use visia_core::{
    config::delivery_sla_rule, phase::transition_table, Actor, AssessmentData, CollectingEventSink,
    ConsentOutcome, ConsentType, CoreConfig, DecisionData, DecisionOutcome, EventSink,
    PrescriptionData, ResourceKey, ResourceSpec, ResourceType, Subject, WorkflowCoordinator,
};

#[derive(Parser)]
#[command(name = "visia")]
#[command(about = "Visia school vision pathway CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the pathway transition graph
    Graph,
    /// Validate a pathway configuration file
    ValidateConfig {
        /// Path to the pathway YAML file
        path: String,
    },
    /// Run one case through the whole pathway in-process
    Simulate,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Graph) => {
            println!("Pathway transitions:");
            for rule in transition_table() {
                let froms: Vec<String> = rule.from.iter().map(|p| p.to_string()).collect();
                let mut gates = Vec::new();
                if let Some(consent) = rule.consent_gate {
                    gates.push(format!("consent:{consent}"));
                }
                if let Some(resource) = rule.resource_gate {
                    gates.push(format!("reservation:{resource}"));
                }
                let gates = if gates.is_empty() {
                    String::new()
                } else {
                    format!("  [{}]", gates.join(", "))
                };
                println!("  {} -> {}{}", froms.join(" | "), rule.to, gates);
            }
        }
        Some(Commands::ValidateConfig { path }) => {
            let raw = std::fs::read_to_string(&path)?;
            match CoreConfig::from_yaml(&raw) {
                Ok(config) => {
                    println!(
                        "OK: {} resources, {} deadline rules",
                        config.resources().len(),
                        config.deadline_rules().len()
                    );
                }
                Err(e) => {
                    eprintln!("Invalid pathway config: {e}");
                    std::process::exit(1);
                }
            }
        }
        Some(Commands::Simulate) => simulate()?,
        None => {
            println!("Run with --help to see available commands.");
        }
    }

    Ok(())
}

/// Walks one synthetic case from registration to closure, printing each
/// committed transition. Uses the in-memory engine only; nothing is sent or
/// persisted.
fn simulate() -> Result<(), Box<dyn std::error::Error>> {
    let slot = ResourceKey::new(ResourceType::AppointmentSlot, "slot-demo-09:00");
    let bucket = "sphere-minus-2-to-minus-4";
    let config = CoreConfig::new(
        chrono::Duration::days(14),
        chrono::Duration::minutes(15),
        chrono::Duration::days(7),
        vec![delivery_sla_rule(14)],
        vec![
            ResourceSpec {
                key: slot.clone(),
                capacity: 1,
            },
            ResourceSpec {
                key: ResourceKey::new(ResourceType::InventoryUnit, bucket),
                capacity: 10,
            },
        ],
    )?;

    let sink = Arc::new(CollectingEventSink::new());
    let coordinator = WorkflowCoordinator::new(
        &config,
        Arc::new(visia_core::LoggingConsentChannel),
        sink.clone() as Arc<dyn EventSink>,
    );

    let subject = Subject {
        id: visia_core::SubjectId::new(),
        name: "Demo Child".parse()?,
        birth_date: "2016-04-02".parse()?,
        school: "Demo Primary School".parse()?,
        guardian_contact: "+44700900000".parse()?,
    };
    let actor = Actor::new("Demo Clinician", "Clinician")?;
    let now = chrono::Utc::now();

    let case = coordinator.register_case(subject, actor.clone(), now)?;
    coordinator.request_consent(case.id, ConsentType::Assessment, actor.clone(), now)?;
    let request = coordinator
        .consent_request(case.id, ConsentType::Assessment, now)
        .ok_or("consent request missing")?;
    coordinator.resolve_consent(&request.channel_ref, ConsentOutcome::Granted, now)?;

    coordinator.advance_to_assessment(
        case.id,
        actor.clone(),
        &slot,
        AssessmentData {
            visual_acuity_left: "6/12".parse()?,
            visual_acuity_right: "6/9".parse()?,
            notes: None,
        },
        now,
    )?;
    coordinator.record_decision(
        case.id,
        actor.clone(),
        DecisionData {
            outcome: DecisionOutcome::GlassesNeeded,
            notes: None,
        },
        now,
    )?;
    coordinator.issue_prescription(
        case.id,
        actor.clone(),
        PrescriptionData {
            sphere_right: -2.25,
            sphere_left: -2.5,
            range_bucket: bucket.parse()?,
        },
        now,
    )?;
    coordinator.order_manufacturing(case.id, actor.clone(), "ORD-DEMO-1".parse()?, now)?;
    let later = now + chrono::Duration::days(9);
    coordinator.record_delivery(case.id, actor.clone(), None, later)?;
    coordinator.schedule_follow_up(case.id, actor.clone(), later + chrono::Duration::days(30), later)?;
    coordinator.close_case(case.id, actor, None, later)?;

    for event in sink.drain_phase_changes() {
        println!("{} -> {}", event.from, event.to);
    }
    let stored = coordinator.get_case(case.id)?;
    println!(
        "Case {} finished in {:?} with {} history rows",
        stored.id,
        stored.status,
        stored.history.len()
    );
    Ok(())
}
