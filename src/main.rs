use clap::Parser;
use roletester::config::{RunnerConfig, load_config_from_file};
use roletester::engine::EngineEvent;
use roletester::sim::{SimCloud, SimIdentity, register_sim_actions};
use roletester::suite::{ActionRegistry, SuiteOptions, load_suite_from_file, run_suite};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;

/// RBAC 적합성 시험 스위트를 시뮬레이터 위에서 실행한다.
#[derive(Debug, Parser)]
#[command(name = "roletester", version)]
struct Cli {
    /// 시험 스위트 YAML 경로.
    #[arg(required_unless_present = "list_actions")]
    suite: Option<PathBuf>,
    /// 실행기 설정 YAML 경로.
    #[arg(long)]
    config: Option<PathBuf>,
    /// 첫 실패 이후 남은 케이스를 실행하지 않는다.
    #[arg(long)]
    fail_fast: bool,
    /// 등록된 액션 이름을 출력하고 끝낸다.
    #[arg(long)]
    list_actions: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config_from_file(path)?,
        None => RunnerConfig::default(),
    };
    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level()?)
        .init();

    let cloud = Arc::new(SimCloud::with_quotas(config.sim.quotas.clone()));
    let mut registry = ActionRegistry::<SimIdentity>::new();
    register_sim_actions(&mut registry, cloud, &config);
    let suite_path = match (&cli.suite, cli.list_actions) {
        (Some(path), false) => path,
        _ => {
            for name in registry.names() {
                println!("{name}");
            }
            return Ok(ExitCode::SUCCESS);
        }
    };

    let suite = load_suite_from_file(suite_path)?;
    let identities = suite.identities_as::<SimIdentity>()?;

    let (tx, mut rx) = unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });
    let options = SuiteOptions {
        max_parallel_cases: config.max_parallel_cases,
        fail_fast: cli.fail_fast,
    };
    let report = run_suite(&suite, &registry, &identities, &options, Some(&tx)).await;
    drop(tx);
    let _ = printer.await;

    println!("{}", report.render());
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::StepStarted {
            scenario,
            index,
            action,
            identity,
        } => println!("[{scenario}] #{index} {action} as {identity}"),
        EngineEvent::StepLog {
            scenario,
            index,
            line,
        } => println!("[{scenario}] #{index}   {line}"),
        EngineEvent::StepFinished {
            scenario,
            index,
            success,
            expected_error,
        } => match (success, expected_error) {
            (true, Some(kind)) => println!("[{scenario}] #{index} ok ({kind} expected)"),
            (true, None) => println!("[{scenario}] #{index} ok"),
            (false, _) => println!("[{scenario}] #{index} FAILED"),
        },
        EngineEvent::ScenarioFinished { scenario, success } => {
            println!(
                "[{scenario}] {}",
                if *success { "완료" } else { "실패" }
            )
        }
    }
}
