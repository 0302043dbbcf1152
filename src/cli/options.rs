use std::path::PathBuf;

/// Parsed `sqlcheck check` invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct CheckOptions {
    pub(crate) targets: Vec<String>,
    pub(crate) db: PathBuf,
    pub(crate) mod_location: PathBuf,
    pub(crate) max_parallel: Option<usize>,
    pub(crate) dry_run: bool,
    pub(crate) where_clause: Option<String>,
    pub(crate) tags: Vec<String>,
    pub(crate) progress: Option<bool>,
}

/// Parse arguments after the program name. `Ok(None)` means help was shown.
pub(crate) fn parse_args(args: Vec<String>) -> Result<Option<CheckOptions>, String> {
    match args.first().map(String::as_str) {
        None | Some("-h" | "--help" | "help") => {
            println!("{}", help_text());
            return Ok(None);
        }
        Some("check") => {}
        Some(other) => return Err(format!("Unknown command: {other}\n\n{}", help_text())),
    }
    let mut options = CheckOptions {
        mod_location: PathBuf::from("."),
        ..CheckOptions::default()
    };
    let mut db = None;
    let mut idx = 1usize;
    while idx < args.len() {
        let flag = args[idx].as_str();
        match flag {
            "-h" | "--help" => {
                println!("{}", help_text());
                return Ok(None);
            }
            "--dry-run" => options.dry_run = true,
            "--progress" => options.progress = Some(true),
            "--no-progress" => options.progress = Some(false),
            "--db" => db = Some(PathBuf::from(value_after(&args, &mut idx, flag)?)),
            "--mod-location" => {
                options.mod_location = PathBuf::from(value_after(&args, &mut idx, flag)?);
            }
            "--max-parallel" => options.max_parallel = Some(parse_parallel(&args, &mut idx)?),
            "--where" => options.where_clause = Some(value_after(&args, &mut idx, flag)?.to_string()),
            "--tag" => options.tags.push(value_after(&args, &mut idx, flag)?.to_string()),
            _ if flag.starts_with('-') => {
                return Err(format!("Unknown argument: {flag}\n\n{}", help_text()));
            }
            _ => options.targets.push(flag.to_string()),
        }
        idx += 1;
    }
    options.db = db.ok_or_else(|| format!("--db is required\n\n{}", help_text()))?;
    if options.targets.is_empty() {
        return Err(format!("check requires at least one target\n\n{}", help_text()));
    }
    if options.where_clause.is_some() && !options.tags.is_empty() {
        return Err("--where and --tag cannot be used together".to_string());
    }
    Ok(Some(options))
}

fn parse_parallel(args: &[String], idx: &mut usize) -> Result<usize, String> {
    let value = value_after(args, idx, "--max-parallel")?;
    match value.parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(format!("Invalid --max-parallel value: {value}")),
    }
}

fn value_after<'a>(args: &'a [String], idx: &mut usize, flag: &str) -> Result<&'a str, String> {
    *idx += 1;
    let value = args.get(*idx).ok_or_else(|| format!("{flag} requires a value"))?;
    Ok(value)
}

fn help_text() -> &'static str {
    "Usage: sqlcheck check <target>... --db <path> [options]\n\n\
Targets:\n\
  all | <mod> | benchmark.<name> | control.<name> | <mod>.benchmark.<name> | <mod>.control.<name>\n\n\
Options:\n\
  --db <path>                  SQLite database to query (required)\n\
  --mod-location <path>        Mod definition file or directory (default: .)\n\
  --max-parallel <n>           Concurrently executing controls (default: config, 5)\n\
  --dry-run                    Build the tree and skip every control\n\
  --where <sql>                Run controls matching a predicate over sqlcheck_control\n\
  --tag <key=value>            Run controls with a matching tag (repeatable)\n\
  --progress / --no-progress   Show or hide the status line (default: config, shown)\n\
  -h, --help                   Show this help\n\n\
Exit codes: 0 no failures, 1 alarms or errors, 2 setup error\n"
}
