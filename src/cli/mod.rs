use std::sync::Arc;

use sqlcheck::client::{Client, SqliteClient};
use sqlcheck::config::{self, Settings};
use sqlcheck::context::RunContext;
use sqlcheck::control::{
    ControlFilter, ControlHooks, ControlProgress, ExecutionOptions, ExecutionTree, NoopHooks,
    StderrStatus,
};
use sqlcheck::logging;
use sqlcheck::workspace::{ModWorkspace, Workspace};
use tracing::{info, warn};

mod options;
mod summary;

use options::CheckOptions;

const EXIT_OK: i32 = 0;
const EXIT_FAILURES: i32 = 1;
const EXIT_SETUP: i32 = 2;

/// Run the command line and return the process exit code.
pub(crate) fn run(args: Vec<String>) -> i32 {
    let options = match options::parse_args(args) {
        Ok(Some(options)) => options,
        Ok(None) => return EXIT_OK,
        Err(err) => {
            eprintln!("{err}");
            return EXIT_SETUP;
        }
    };
    let loaded = config::load_or_default();
    let settings = loaded.as_ref().cloned().unwrap_or_default();
    if let Err(err) = logging::init(&settings.logging) {
        eprintln!("Logging disabled: {err}");
    }
    if let Err(err) = &loaded {
        warn!("Using default settings: {err}");
    }
    match check(&options, &settings) {
        Ok(0) => EXIT_OK,
        Ok(_) => EXIT_FAILURES,
        Err(err) => {
            eprintln!("{err}");
            EXIT_SETUP
        }
    }
}

fn check(options: &CheckOptions, settings: &Settings) -> Result<u64, String> {
    let workspace: Arc<dyn Workspace> = Arc::new(
        ModWorkspace::load(&options.mod_location).map_err(|err| err.to_string())?,
    );
    let client: Arc<dyn Client> =
        Arc::new(SqliteClient::open(&options.db).map_err(|err| err.to_string())?);
    let ctx = RunContext::cancellable();
    let handler_ctx = ctx.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        handler_ctx.cancel(Some("interrupted".to_string()));
    }) {
        warn!("Interrupt handler not installed: {err}");
    }

    let execution = execution_options(options, settings);
    let progress = options.progress.unwrap_or(settings.output.progress);
    let mut failures = 0;
    for target in &options.targets {
        let hooks: Arc<dyn ControlHooks> = if progress {
            Arc::new(ControlProgress::new(StderrStatus))
        } else {
            Arc::new(NoopHooks)
        };
        let mut tree = ExecutionTree::build(
            workspace.clone(),
            client.clone(),
            target,
            execution.clone(),
            hooks,
        )
        .map_err(|err| err.to_string())?;
        failures += tree.execute(&ctx);
        let mut stdout = std::io::stdout().lock();
        summary::write_tree(&mut stdout, &tree)
            .map_err(|err| format!("Failed to write summary: {err}"))?;
        if let Some(cause) = ctx.err() {
            info!("Stopping after {target}: {cause}");
            break;
        }
    }
    Ok(failures)
}

fn execution_options(options: &CheckOptions, settings: &Settings) -> ExecutionOptions {
    let mut execution = ExecutionOptions::from_settings(settings);
    if let Some(max_parallel) = options.max_parallel {
        execution.max_parallel = max_parallel;
    }
    execution.dry_run = options.dry_run;
    execution.filter = ControlFilter {
        where_clause: options.where_clause.clone(),
        tags: options.tags.clone(),
    };
    execution
}
