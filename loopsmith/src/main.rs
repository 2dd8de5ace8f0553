//! PRD → plan → build → verify loop driver.
//!
//! Keeps per-project state under `.loopsmith/` and drives an OpenCode work
//! session one task at a time. See `loopsmith --help` for the commands.

use std::env;
use std::path::Path;
use std::process;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use loopsmith::core::task::Task;
use loopsmith::exit_codes;
use loopsmith::io::backlog::{load_backlog, write_backlog};
use loopsmith::io::config::{LoopConfig, load_config};
use loopsmith::io::gates::{GateSource, persist_auto_gates, resolve_gates};
use loopsmith::io::lock::force_unlock;
use loopsmith::io::notify::{Notifier, TracingNotifier};
use loopsmith::io::opencode::OpencodeClient;
use loopsmith::io::paths::{InitOptions, ProjectPaths, init_project};
use loopsmith::io::prompts::{DEFAULT_PROMPT_BUDGET, PromptEngine};
use loopsmith::io::shell::SystemShell;
use loopsmith::io::task_store::{load_tasks, write_tasks};
use loopsmith::io::ui_verify::HttpProbe;
use loopsmith::logging;
use loopsmith::plan::{PlanDeps, plan_feature};
use loopsmith::progress::ProgressRegistry;
use loopsmith::run::{RunCommandResult, RunDeps, RunOptions, guard_control_session, run_command};
use loopsmith::select::{SelectOutcome, select_from_root};
use loopsmith::status::status_report;

#[derive(Parser)]
#[command(
    name = "loopsmith",
    version,
    about = "Drive an LLM coding agent through a PRD → plan → build → verify loop"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.loopsmith/` scaffolding (PRD draft, config, empty task list).
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Show run state, task counts and backlog.
    Status,
    /// Print the id of the next eligible task.
    Select,
    /// Add a feature request to the backlog.
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        request: String,
    },
    /// Manage tasks directly.
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Decompose a backlog feature into tasks.
    Plan {
        /// Feature id, e.g. F-001.
        feature: String,
        /// Derive a single task from the request without asking the agent.
        #[arg(long)]
        no_agent: bool,
        #[arg(long)]
        control_session: Option<String>,
    },
    /// Show the gates a run would execute.
    Gates {
        /// Write auto-detected gates into the config.
        #[arg(long)]
        persist: bool,
    },
    /// Run the build/verify loop.
    Run {
        /// Maximum attempts for this invocation (defaults to config `max_items`).
        #[arg(long)]
        max_items: Option<u32>,
        /// Session this run was invoked from; it is never deleted.
        #[arg(long)]
        control_session: Option<String>,
    },
    /// Remove a stale run lock left by a killed process.
    Unlock,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Append a task to the end of the task list.
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        acceptance: Vec<String>,
        #[arg(long = "done-when")]
        done_when: Vec<String>,
        #[arg(long)]
        scope: Vec<String>,
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Status => cmd_status(&root),
        Command::Select => cmd_select(&root),
        Command::Add { title, request } => cmd_add(&root, &title, &request),
        Command::Task {
            command:
                TaskCommand::Add {
                    title,
                    acceptance,
                    done_when,
                    scope,
                    depends_on,
                },
        } => {
            let mut task = Task::new("T-000", title.trim());
            task.acceptance = acceptance;
            task.done_when = done_when;
            task.scope = scope;
            task.depends_on = depends_on.into_iter().collect();
            cmd_task_add(&root, task)
        }
        Command::Plan {
            feature,
            no_agent,
            control_session,
        } => cmd_plan(&root, &feature, !no_agent, control_session.as_deref()),
        Command::Gates { persist } => cmd_gates(&root, persist),
        Command::Run {
            max_items,
            control_session,
        } => cmd_run(&root, max_items, control_session),
        Command::Unlock => cmd_unlock(&root),
    }
}

fn project(root: &Path) -> Result<ProjectPaths> {
    let paths = ProjectPaths::new(root);
    if !paths.loop_dir.is_dir() {
        return Err(anyhow!(
            "no .loopsmith directory in {} (run `loopsmith init` first)",
            root.display()
        ));
    }
    Ok(paths)
}

fn config(paths: &ProjectPaths) -> Result<LoopConfig> {
    let cfg = load_config(&paths.config_path)?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", paths.config_path.display()))?;
    Ok(cfg)
}

fn platform_client(paths: &ProjectPaths, cfg: &LoopConfig) -> OpencodeClient {
    let directory = cfg
        .platform
        .directory
        .clone()
        .or_else(|| Some(paths.root.display().to_string()));
    OpencodeClient::new(&cfg.platform.base_url, directory, cfg.judge_timeout())
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_project(root, &InitOptions { force })?;
    println!("initialized {}", paths.loop_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path) -> Result<i32> {
    let paths = project(root)?;
    print!("{}", status_report(&paths)?);
    Ok(exit_codes::OK)
}

fn cmd_select(root: &Path) -> Result<i32> {
    project(root)?;
    match select_from_root(root)? {
        SelectOutcome::Complete => {
            eprintln!("no eligible task: every task is completed or cancelled");
            Ok(exit_codes::COMPLETE)
        }
        SelectOutcome::Next(task) => {
            if !task.unmet_dependencies.is_empty() {
                eprintln!(
                    "warning: {} depends on unfinished {}",
                    task.id,
                    task.unmet_dependencies.join(", ")
                );
            }
            println!("{}", task.id);
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_add(root: &Path, title: &str, request: &str) -> Result<i32> {
    let paths = project(root)?;
    let mut backlog = load_backlog(&paths.backlog_path)?;
    let id = backlog.add_feature(title, request);
    write_backlog(&paths.backlog_path, &backlog)?;
    println!("{id}");
    Ok(exit_codes::OK)
}

fn cmd_task_add(root: &Path, task: Task) -> Result<i32> {
    let paths = project(root)?;
    let mut tasks = load_tasks(&paths.tasks_path)?;
    let id = tasks.push_new(task);
    write_tasks(&paths.tasks_path, &tasks)?;
    println!("{id}");
    Ok(exit_codes::OK)
}

fn cmd_plan(root: &Path, feature: &str, use_agent: bool, control: Option<&str>) -> Result<i32> {
    let paths = project(root)?;
    let cfg = config(&paths)?;
    let client = platform_client(&paths, &cfg);
    let prompts = PromptEngine::new(DEFAULT_PROMPT_BUDGET)?;
    if use_agent
        && let Some(refusal) = guard_control_session(&paths, &client, &prompts, control)?
    {
        eprintln!("plan refused: {refusal}");
        return Ok(exit_codes::PREFLIGHT);
    }
    let outcome = plan_feature(
        &PlanDeps {
            paths: &paths,
            config: &cfg,
            platform: &client,
            prompts: &prompts,
        },
        feature,
        use_agent,
    )?;
    if let Some(reason) = &outcome.fallback_reason {
        eprintln!("using a single fallback task: {reason}");
    }
    println!("{}: {}", outcome.feature_id, outcome.task_ids.join(" "));
    Ok(exit_codes::OK)
}

fn cmd_gates(root: &Path, persist: bool) -> Result<i32> {
    let paths = project(root)?;
    let cfg = config(&paths)?;
    let mut gates = resolve_gates(root, &cfg);
    if persist {
        gates = persist_auto_gates(root, &paths.config_path, &gates)?;
    }
    if gates.is_empty() {
        eprintln!("no gates configured or detected");
        return Ok(exit_codes::INVALID);
    }
    for gate in &gates {
        let source = match gate.source {
            GateSource::Auto => "auto",
            GateSource::Configured => "configured",
        };
        println!("{}\t{}\t{}", gate.name, source, gate.command);
    }
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, max_items: Option<u32>, control_session: Option<String>) -> Result<i32> {
    let paths = project(root)?;
    let cfg = config(&paths)?;
    let client = platform_client(&paths, &cfg);
    let prompts = PromptEngine::new(DEFAULT_PROMPT_BUDGET)?;
    let probe = HttpProbe::new();
    let progress = ProgressRegistry::new();
    let channel = control_session.clone().unwrap_or_else(|| "cli".to_string());
    // Toasts only reach a TUI when the run was started from one.
    let notifier: &dyn Notifier = if control_session.is_some() {
        &client
    } else {
        &TracingNotifier
    };
    progress.create(
        &channel,
        Box::new(|snapshot| {
            eprintln!("{}", snapshot.render());
            Ok(())
        }),
        cfg.progress.max_lines,
    );

    let deps = RunDeps {
        paths: &paths,
        config: &cfg,
        platform: &client,
        shell: &SystemShell,
        notifier,
        probe: &probe,
        progress: &progress,
        prompts: &prompts,
    };
    let options = RunOptions {
        max_items: max_items.unwrap_or(cfg.max_items),
        control_session,
        progress_channel: channel,
    };
    let result = run_command(&deps, &options);
    println!("{}", result.summary());
    Ok(match result {
        RunCommandResult::Refused(_) => exit_codes::PREFLIGHT,
        RunCommandResult::Finished(_) | RunCommandResult::Crashed { .. } => exit_codes::OK,
    })
}

fn cmd_unlock(root: &Path) -> Result<i32> {
    let paths = project(root)?;
    if force_unlock(&paths.lock_path)? {
        println!("removed {}", paths.relative(&paths.lock_path));
    } else {
        println!("no run lock present");
    }
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["loopsmith", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_options() {
        let cli = Cli::parse_from([
            "loopsmith",
            "run",
            "--max-items",
            "2",
            "--control-session",
            "ses_ctl",
        ]);
        match cli.command {
            Command::Run {
                max_items,
                control_session,
            } => {
                assert_eq!(max_items, Some(2));
                assert_eq!(control_session.as_deref(), Some("ses_ctl"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_task_add_repeated_flags() {
        let cli = Cli::parse_from([
            "loopsmith",
            "task",
            "add",
            "--title",
            "Login",
            "--done-when",
            "npm test",
            "--done-when",
            "npm run lint",
            "--depends-on",
            "T-001",
        ]);
        let Command::Task {
            command: TaskCommand::Add {
                done_when,
                depends_on,
                ..
            },
        } = cli.command
        else {
            panic!("expected task add");
        };
        assert_eq!(done_when, vec!["npm test", "npm run lint"]);
        assert_eq!(depends_on, vec!["T-001"]);
    }

    #[test]
    fn parse_plan_without_agent() {
        let cli = Cli::parse_from(["loopsmith", "plan", "F-001", "--no-agent"]);
        assert!(matches!(cli.command, Command::Plan { no_agent: true, .. }));
    }
}
