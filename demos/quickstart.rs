use anyhow::Result;
use sandbox_pilot::{
    Agent, AgentConfig, DesktopConfig, Mode, ModelClient, ModelConfig, Session, ShutdownMode,
    X11Desktop,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let instruction = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let instruction = if instruction.trim().is_empty() {
        "Open a terminal".to_string()
    } else {
        instruction
    };
    let single_step = std::env::var("AGENT_SINGLE_STEP").map(|v| v == "1").unwrap_or(false);

    let desktop = X11Desktop::new(DesktopConfig::default());
    let model = ModelClient::new(ModelConfig::default())?;
    let agent = Agent::new(Session::new(desktop), model.clone(), model, AgentConfig::default());
    agent.start().await?;

    let mode = if single_step { Mode::SingleStep } else { Mode::MultiStep };
    let cfg = agent.config();
    println!(
        "running {:?} with up to {} steps within {}s",
        mode,
        cfg.max_steps,
        cfg.invocation_timeout.as_secs()
    );
    let report = agent.execute(&instruction, mode).await?;
    for (i, step) in report.action_log.iter().enumerate() {
        println!("{:>2}. {:?} ok={} {}", i + 1, step.kind, step.success, step.message);
    }
    println!(
        "state={:?} reason={:?} iterations={} completed={}",
        report.state, report.completion_reason, report.iterations, report.completed
    );

    agent.shutdown(ShutdownMode::Graceful).await?;
    Ok(())
}
