use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use autoopt::{
    analyze, is_executable, validate, BridgeError, Config, Framework, GatePolicy, GenerationError, Pipeline,
};

/// The generator picked from the configuration
type DynGenerator = Box<dyn Fn(&str) -> Result<String, GenerationError>>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Turn optimization problems described in plain language into solved models.
#[derive(Parser)]
#[command(name = "autoopt", version, about)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log format on stderr
    #[arg(long, global = true, default_value = "pretty", value_enum)]
    log_format: LogFormat,

    /// More log output (repeatable). AUTOOPT_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate model code for a description and print it with its structural facts
    Generate {
        description: String,
        /// pyomo or pulp (default: from the configuration)
        #[arg(long)]
        framework: Option<String>,
        /// Also write the generated code to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the structural facts of a model file as JSON
    Analyze {
        file: PathBuf,
        #[arg(long)]
        framework: Option<String>,
    },
    /// Check a model file; exits with status 1 when it is invalid
    Validate {
        file: PathBuf,
        #[arg(long)]
        framework: Option<String>,
    },
    /// Run a model file and print its solution record
    Solve {
        file: PathBuf,
        #[arg(long)]
        framework: Option<String>,
        #[arg(long)]
        solver: Option<String>,
        /// advisory, syntax or strict
        #[arg(long)]
        gate: Option<String>,
    },
    /// Generate, validate and solve in one go
    Run {
        description: String,
        #[arg(long)]
        framework: Option<String>,
        #[arg(long)]
        solver: Option<String>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("could not access '{}': {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("could not serialize output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to initialize logging: {0}")]
    Logging(String),
}

fn init_logging(format: LogFormat, verbose: u8) -> Result<(), CliError> {
    let filter = match std::env::var("AUTOOPT_LOG") {
        Ok(directives) => EnvFilter::try_new(&directives).map_err(|err| CliError::Logging(err.to_string()))?,
        Err(_) => {
            let level = match verbose {
                0 => LevelFilter::WARN,
                1 => LevelFilter::INFO,
                2 => LevelFilter::DEBUG,
                _ => LevelFilter::TRACE,
            };
            EnvFilter::default().add_directive(level.into())
        }
    };
    let base = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => base
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr).json())
            .try_init(),
        LogFormat::Pretty => base
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr).pretty())
            .try_init(),
    };
    result.map_err(|err| CliError::Logging(err.to_string()))
}

fn load_config(path: Option<&Path>) -> Result<Config, CliError> {
    match path {
        Some(path) => Ok(Config::load(path).map_err(BridgeError::from)?),
        None => Ok(Config::default()),
    }
}

fn framework_or(name: Option<&str>, config: &Config) -> Result<Framework, CliError> {
    match name {
        Some(name) => Ok(name.parse()?),
        None => Ok(config.solver.framework),
    }
}

fn read(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn print_json(value: &impl Serialize) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(feature = "llm")]
fn generator(config: &Config) -> Result<DynGenerator, CliError> {
    use autoopt::TextGenerator;

    let client = autoopt::llm::OpenAiChat::from_config(&config.llm).map_err(BridgeError::from)?;
    Ok(Box::new(move |prompt: &str| client.generate(prompt)))
}

#[cfg(not(feature = "llm"))]
fn generator(_config: &Config) -> Result<DynGenerator, CliError> {
    Err(BridgeError::from(GenerationError::Unavailable(
        "this build has no text generation client (enable the llm feature)".to_string(),
    ))
    .into())
}

#[derive(Serialize)]
struct Validation<'a> {
    framework: Framework,
    is_valid: bool,
    issues: &'a [String],
    is_executable: bool,
    syntax_error: Option<String>,
}

#[derive(Serialize)]
struct Generated<'a> {
    framework: Framework,
    code: &'a str,
    facts: autoopt::StructuralFacts,
}

fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let mut config = load_config(cli.config.as_deref())?;
    debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Generate {
            description,
            framework,
            output,
        } => {
            let framework = framework_or(framework.as_deref(), &config)?;
            let pipeline = Pipeline::new(generator(&config)?, config);
            let code = pipeline.generate(&description, framework)?;
            if let Some(path) = &output {
                std::fs::write(path, &code).map_err(|source| CliError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
            print_json(&Generated {
                framework,
                code: &code,
                facts: analyze(&code, framework),
            })?;
        }
        Commands::Analyze { file, framework } => {
            let framework = framework_or(framework.as_deref(), &config)?;
            print_json(&analyze(&read(&file)?, framework))?;
        }
        Commands::Validate { file, framework } => {
            let framework = framework_or(framework.as_deref(), &config)?;
            let code = read(&file)?;
            let verdict = validate(&analyze(&code, framework), framework);
            let (executable, syntax_error) = is_executable(&code);
            print_json(&Validation {
                framework,
                is_valid: verdict.is_valid(),
                issues: verdict.issues(),
                is_executable: executable,
                syntax_error,
            })?;
            if !(verdict.is_valid() && executable) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Solve {
            file,
            framework,
            solver,
            gate,
        } => {
            let framework = framework_or(framework.as_deref(), &config)?;
            if let Some(gate) = gate {
                config.validation.gate = gate.parse::<GatePolicy>().map_err(BridgeError::from)?;
            }
            let code = read(&file)?;
            let pipeline = Pipeline::new(unavailable_generator, config);
            let record = pipeline.solve(&code, framework, solver.as_deref())?;
            print_json(&record)?;
            if record.is_error() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Run {
            description,
            framework,
            solver,
        } => {
            let framework = framework_or(framework.as_deref(), &config)?;
            let pipeline = Pipeline::new(generator(&config)?, config);
            let report = pipeline.run(&description, framework, solver.as_deref())?;
            print_json(&report)?;
            if report.record.is_error() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Solving a file needs no generation
fn unavailable_generator(_prompt: &str) -> Result<String, GenerationError> {
    Err(GenerationError::Unavailable("no generation needed to solve a file".to_string()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.log_format, cli.verbose) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            match &err {
                CliError::Bridge(bridge) => eprintln!("error [{}]: {err}", bridge.code()),
                _ => eprintln!("error: {err}"),
            }
            ExitCode::FAILURE
        }
    }
}
