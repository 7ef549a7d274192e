use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use futures::future::{BoxFuture, FutureExt};
use kinetic_flow::config::EngineConfig;
use kinetic_flow::engine::{ActionType, Engine, NextStep, PendingAction};
use kinetic_flow::workflow::{Step, Validator, WorkflowLoader};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a workflow file and report every issue found
    Validate {
        /// Path to the workflow file
        file: String,
    },
    /// Run a workflow, reading external step results from stdin
    ///
    /// Each pending action is printed as one JSON line; answer with one JSON
    /// line holding the result, e.g. {"value": "yes"} for a wait step.
    Run {
        /// Path to the workflow file
        file: String,

        /// Workflow inputs as a JSON object
        #[arg(short, long, default_value = "{}")]
        inputs: String,
    },
    /// Print the step tree of a workflow
    Inspect {
        /// Path to the workflow file
        file: String,

        /// Print the normalised YAML document instead
        #[arg(long)]
        yaml: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => EngineConfig::from_env(),
    };

    match args.command {
        Commands::Validate { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file))?;
            match Validator::new(&config).validate_str(&text) {
                Ok(def) => println!("ok: {}", def.key()),
                Err(e) if !e.issues().is_empty() => {
                    for issue in e.issues() {
                        println!("{}", issue);
                    }
                    bail!("{} issue(s) found in {}", e.issues().len(), file);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Run { file, inputs } => {
            let inputs: Value =
                serde_json::from_str(&inputs).context("--inputs must be a JSON object")?;
            let engine = Engine::new(config);
            let key = engine.load_file(&file).await?;
            log::info!("Loaded workflow {}", key);

            let started = engine.start(&key, inputs).await?;
            run_to_completion(&engine, started.instance_id).await?;
        }
        Commands::Inspect { file, yaml } => {
            let def = WorkflowLoader::new(&config).load_workflow(&file)?;
            if yaml {
                print!("{}", WorkflowLoader::to_yaml(&def)?);
                return Ok(());
            }
            println!("{}", def.key());
            if let Some(description) = &def.description {
                println!("  {}", description);
            }
            for (name, spec) in &def.inputs {
                let required = if spec.is_required() { "required" } else { "optional" };
                println!("  input {}: {} ({})", name, spec.input_type.as_str(), required);
            }
            print_steps(&def.steps, 1);
            for (name, steps) in &def.tasks {
                println!("task {}", name);
                print_steps(steps, 1);
            }
        }
    }

    Ok(())
}

async fn run_to_completion(engine: &Engine, id: Uuid) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match engine.get_next_step(id).await? {
            NextStep::Action { action } => {
                let Some(action) = runnable(engine, action).await? else {
                    bail!("instance {} has no runnable action", id);
                };
                println!("{}", serde_json::to_string(&action)?);
                let Some(line) = lines.next_line().await? else {
                    log::warn!("stdin closed; instance {} left suspended", id);
                    return Ok(());
                };
                let result: Value = read_result(&line)?;
                engine
                    .submit_result(action.instance_id, &action.step_id, result)
                    .await?;
            }
            NextStep::Complete {
                status,
                result,
                error,
            } => {
                println!("status: {}", status);
                if let Some(result) = result {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                if let Some(error) = error {
                    bail!("{}: {}", error.kind, error.message);
                }
                return Ok(());
            }
            NextStep::Waiting | NextStep::Blocked => {
                bail!("instance {} cannot make progress", id)
            }
        }
    }
}

/// Act as the sub-agent for delegated iterations: find a child action to run
fn runnable(
    engine: &Engine,
    action: PendingAction,
) -> BoxFuture<'_, anyhow::Result<Option<PendingAction>>> {
    async move {
        if action.action != ActionType::DelegateIteration {
            return Ok(Some(action));
        }
        let children: Vec<Uuid> = serde_json::from_value(action.params["children"].clone())?;
        for child in children {
            if let NextStep::Action { action } = engine.get_next_step(child).await? {
                if let Some(found) = runnable(engine, action).await? {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }
    .boxed()
}

fn read_result(line: &str) -> anyhow::Result<Value> {
    serde_json::from_str(line.trim()).context("step result must be one line of JSON")
}

fn print_steps(steps: &[Step], depth: usize) {
    let indent = "  ".repeat(depth);
    for step in steps {
        let mut line = format!("{}{} [{}]", indent, step.id, step.type_name());
        if !step.needs_state.is_empty() {
            line.push_str(&format!(" needs {}", step.needs_state.join(", ")));
        }
        if let Some(target) = &step.output_to {
            line.push_str(&format!(" -> {}", target));
        }
        println!("{}", line);
        for (label, children) in step.children() {
            println!("{}  {}:", indent, label);
            print_steps(children, depth + 2);
        }
    }
}
