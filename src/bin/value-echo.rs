#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use value_echo::analysis::clustering::ClusterAssignments;
use value_echo::analysis::residualize::Pc1Scores;
use value_echo::pipeline::{self, RunInputs, Study, TableOutput, TABLES_DIR};
use value_echo::synthetic::{self, SyntheticConfig};
use value_echo::ingest::SCHEMA_FILE;
use value_echo::{AnalysisError, Panel, ReadOptions, SliderSchema, StudyConfig};

#[derive(Parser)]
#[command(name = "value-echo", version, about = "Value-hierarchy survey analysis pipeline")]
struct Cli {
    /// Study configuration (YAML or JSON); defaults to the built-in study
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log filter, e.g. `debug` or `value_echo=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Also write every result table as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct StudyArgs {
    /// Block config: `BLOCK: {mapping: {PAIR: COLUMN}}`
    #[arg(long)]
    blocks: PathBuf,
    /// Pair-list config; defaults to every catalog pair
    #[arg(long)]
    pairs: Option<PathBuf>,
}

#[derive(Args, Clone, Default)]
struct ReadArgs {
    /// Header rows in the export (1 or 2)
    #[arg(long)]
    header_rows: Option<usize>,
    /// Sheet name or index for spreadsheet exports
    #[arg(long)]
    sheet: Option<String>,
}

impl ReadArgs {
    fn options(&self) -> ReadOptions {
        ReadOptions {
            header_rows: self.header_rows,
            sheet: self.sheet.clone(),
        }
    }
}

#[derive(Args, Clone, Default)]
struct CleaningArgs {
    #[arg(long)]
    completeness: Option<f64>,
    #[arg(long)]
    sd_floor: Option<f64>,
    #[arg(long)]
    mad_floor: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Admin filters, slider detection and participant quality filter
    Clean {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        #[command(flatten)]
        read: ReadArgs,
        #[command(flatten)]
        cleaning: CleaningArgs,
    },
    /// Build the long panel from the cleaned table
    Panel {
        #[arg(long)]
        clean: PathBuf,
        #[command(flatten)]
        study: StudyArgs,
        /// Separate baseline table; the cleaned table is used when absent
        #[arg(long)]
        baseline: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Per-block echo slopes (A1)
    Echo {
        #[arg(long)]
        panel: PathBuf,
        #[command(flatten)]
        study: StudyArgs,
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Residualise block items on PC1 and re-fit the echo (A2)
    Residualize {
        #[arg(long)]
        clean: PathBuf,
        #[command(flatten)]
        study: StudyArgs,
        #[arg(long)]
        baseline: Option<PathBuf>,
        /// Slider schema from `clean`; defaults to the one next to `--clean`
        #[arg(long)]
        schema: Option<PathBuf>,
        /// Precomputed `participant_id,PC1` scores
        #[arg(long)]
        pc1: Option<PathBuf>,
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Leave-one-block-out and leave-one-pair-out (A3)
    Robustness {
        #[arg(long)]
        panel: PathBuf,
        #[command(flatten)]
        study: StudyArgs,
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// ICC(2,1) between baseline and mean block rating per pair (A4)
    Icc {
        #[arg(long)]
        clean: PathBuf,
        #[command(flatten)]
        study: StudyArgs,
        #[arg(long)]
        baseline: Option<PathBuf>,
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Block-level omega and PCA variance shares (B1)
    Structure {
        #[arg(long)]
        clean: PathBuf,
        #[command(flatten)]
        study: StudyArgs,
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// PhaseI x block interaction model with simple slopes (A5)
    Context {
        #[arg(long)]
        panel: PathBuf,
        #[command(flatten)]
        study: StudyArgs,
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Gaussian-mixture clustering of per-participant slopes (B2)
    Cluster {
        #[arg(long)]
        panel: PathBuf,
        #[command(flatten)]
        study: StudyArgs,
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Cluster moderation of the echo per block (B3)
    Moderation {
        #[arg(long)]
        panel: PathBuf,
        #[arg(long)]
        assignments: PathBuf,
        #[command(flatten)]
        study: StudyArgs,
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Theory-profile signatures, means and slopes (B4)
    Profiles {
        #[arg(long)]
        clean: PathBuf,
        #[command(flatten)]
        study: StudyArgs,
        #[arg(long)]
        baseline: Option<PathBuf>,
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Every stage in order into one directory
    Run {
        #[arg(long)]
        input: PathBuf,
        #[command(flatten)]
        study: StudyArgs,
        #[arg(long)]
        baseline: Option<PathBuf>,
        #[arg(long)]
        pc1: Option<PathBuf>,
        #[arg(long)]
        out_dir: PathBuf,
        #[command(flatten)]
        read: ReadArgs,
        #[command(flatten)]
        cleaning: CleaningArgs,
    },
    /// Write a synthetic export with matching pair and block files
    Simulate {
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long, default_value_t = 20)]
        participants: usize,
        #[arg(long, default_value_t = 7)]
        seed: u64,
        #[arg(long, default_value_t = 0)]
        flatliners: usize,
        #[arg(long, default_value_t = 0)]
        incomplete: usize,
    },
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>, overrides: &CleaningArgs) -> Result<StudyConfig, AnalysisError> {
    let mut config = match path {
        Some(p) => StudyConfig::load(p)?,
        None => StudyConfig::default(),
    };
    if let Some(v) = overrides.completeness {
        config.cleaning.completeness_threshold = v;
    }
    if let Some(v) = overrides.sd_floor {
        config.cleaning.sd_floor = v;
    }
    if let Some(v) = overrides.mad_floor {
        config.cleaning.mad_floor = v;
    }
    config.validate()?;
    Ok(config)
}

fn load_study(config: Option<&Path>, overrides: &CleaningArgs, args: &StudyArgs) -> Result<Study, AnalysisError> {
    let config = load_config(config, overrides)?;
    let catalog = config.catalog()?;
    let blocks = value_echo::BlockMap::load(&args.blocks, &catalog, &config)?;
    let pairs = args
        .pairs
        .as_deref()
        .map(|p| value_echo::config::load_pairs(p, &catalog))
        .transpose()?;
    Study::new(config, blocks, pairs)
}

fn tables(dir: &Path, json: bool) -> TableOutput {
    TableOutput::new(dir.join(TABLES_DIR), json)
}

fn run(cli: Cli) -> Result<(), AnalysisError> {
    let config = cli.config.as_deref();
    let json = cli.json;
    let none = CleaningArgs::default();

    match cli.command {
        Commands::Clean {
            input,
            out_dir,
            read,
            cleaning,
        } => {
            let config = load_config(config, &cleaning)?;
            let outcome = value_echo::ingest::clean_file(&input, &read.options(), &config)?;
            let paths = value_echo::ingest::write_clean_artifacts(&outcome, &out_dir)?;
            info!(cleaned = %paths.cleaned.display(), dropped = %paths.dropped.display(), "clean artifacts written");
        }
        Commands::Panel {
            clean,
            study,
            baseline,
            out,
        } => {
            let study = load_study(config, &none, &study)?;
            let wide = pipeline::read_wide(&clean)?;
            let baseline = study.baseline(&wide, baseline.as_deref())?;
            pipeline::run_panel(&study, &wide, &baseline, &out)?;
        }
        Commands::Echo {
            panel,
            study,
            out_dir,
        } => {
            let study = load_study(config, &none, &study)?;
            let panel = Panel::read_csv(&panel, &study.catalog)?;
            pipeline::run_echo(&study, &panel, &tables(&out_dir, json))?;
        }
        Commands::Residualize {
            clean,
            study,
            baseline,
            schema,
            pc1,
            out_dir,
        } => {
            let study = load_study(config, &none, &study)?;
            let wide = pipeline::read_wide(&clean)?;
            let schema = SliderSchema::load(schema.unwrap_or_else(|| clean.with_file_name(SCHEMA_FILE)))?;
            let baseline = study.baseline(&wide, baseline.as_deref())?;
            let pc1 = pc1
                .as_deref()
                .map(|p| Pc1Scores::read_csv(p, &study.config.participant_column))
                .transpose()?;
            pipeline::run_residualize(&study, &wide, &schema, &baseline, pc1, &out_dir, &tables(&out_dir, json))?;
        }
        Commands::Robustness {
            panel,
            study,
            out_dir,
        } => {
            let study = load_study(config, &none, &study)?;
            let panel = Panel::read_csv(&panel, &study.catalog)?;
            let (lobo, lopo) = pipeline::run_robustness(&study, &panel, &tables(&out_dir, json))?;
            for failed in lobo.failures().chain(lopo.failures()) {
                warn!(omitted = %failed.omitted, status = %failed.status.label(), "refit failed");
            }
        }
        Commands::Icc {
            clean,
            study,
            baseline,
            out_dir,
        } => {
            let study = load_study(config, &none, &study)?;
            let wide = pipeline::read_wide(&clean)?;
            let baseline = study.baseline(&wide, baseline.as_deref())?;
            pipeline::run_icc(&study, &wide, &baseline, &tables(&out_dir, json))?;
        }
        Commands::Structure {
            clean,
            study,
            out_dir,
        } => {
            let study = load_study(config, &none, &study)?;
            let wide = pipeline::read_wide(&clean)?;
            pipeline::run_structure(&study, &wide, &tables(&out_dir, json))?;
        }
        Commands::Context {
            panel,
            study,
            out_dir,
        } => {
            let study = load_study(config, &none, &study)?;
            let panel = Panel::read_csv(&panel, &study.catalog)?;
            pipeline::run_context(&study, &panel, &tables(&out_dir, json))?;
        }
        Commands::Cluster {
            panel,
            study,
            out_dir,
        } => {
            let study = load_study(config, &none, &study)?;
            let panel = Panel::read_csv(&panel, &study.catalog)?;
            pipeline::run_cluster(&study, &panel, &out_dir, &tables(&out_dir, json))?;
        }
        Commands::Moderation {
            panel,
            assignments,
            study,
            out_dir,
        } => {
            let study = load_study(config, &none, &study)?;
            let panel = Panel::read_csv(&panel, &study.catalog)?;
            let assignments = ClusterAssignments::read_csv(&assignments)?;
            pipeline::run_moderation(&study, &panel, &assignments, &tables(&out_dir, json))?;
        }
        Commands::Profiles {
            clean,
            study,
            baseline,
            out_dir,
        } => {
            let study = load_study(config, &none, &study)?;
            let wide = pipeline::read_wide(&clean)?;
            let baseline = study.baseline(&wide, baseline.as_deref())?;
            pipeline::run_profiles(&study, &wide, &baseline, &out_dir, &tables(&out_dir, json))?;
        }
        Commands::Run {
            input,
            study,
            baseline,
            pc1,
            out_dir,
            read,
            cleaning,
        } => {
            let study = load_study(config, &cleaning, &study)?;
            let inputs = RunInputs {
                export: input,
                read: read.options(),
                baseline,
                pc1,
            };
            let summary = pipeline::run_all(&study, &inputs, &out_dir, json)?;
            for (stage, reason) in &summary.skipped {
                warn!(stage = %stage, reason = %reason, "stage produced no output");
            }
        }
        Commands::Simulate {
            out_dir,
            participants,
            seed,
            flatliners,
            incomplete,
        } => {
            let config = load_config(config, &none)?;
            let catalog = config.catalog()?;
            let settings = SyntheticConfig {
                participants,
                seed,
                flatliners,
                incomplete,
                ..SyntheticConfig::default()
            };
            let study = synthetic::generate(&config, &catalog, &settings)?;
            let paths = study.write(&out_dir, &catalog)?;
            info!(export = %paths.export.display(), blocks = %paths.blocks.display(), "synthetic study written");
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_underdetermined() => {
            warn!(error = %e, "stage produced no result");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, configuration = e.is_configuration(), "stage failed");
            ExitCode::FAILURE
        }
    }
}
