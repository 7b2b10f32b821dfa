use clap::{Args, Parser, Subcommand, ValueEnum};
use siteport_core::Mode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "siteportdev CLI: resumable multisite migrations", long_about = None)]
pub struct Cli {
    /// Directory holding one progress file per (blog, mode)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Import,
    Export,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Import => Mode::Import,
            ModeArg::Export => Mode::Export,
        }
    }
}

/// Options shared by `export` and `import`.
#[derive(Args)]
pub struct JobArgs {
    /// SQLite database of the network
    #[arg(long)]
    pub db: PathBuf,

    #[arg(long, default_value_t = 1)]
    pub blog: u64,

    /// Package to write (export) or read (import)
    #[arg(long)]
    pub package: PathBuf,

    /// Scratch directory owned by the migration
    #[arg(long)]
    pub work_dir: PathBuf,

    /// Uploads directory of the blog
    #[arg(long)]
    pub media_dir: PathBuf,

    /// Skip paths matching a rule (name, path/prefix or *ext); repeatable
    #[arg(long = "exclude")]
    pub exclude: Vec<String>,

    /// Export: url recorded in the package. Import: url to rewrite to.
    #[arg(long)]
    pub site_url: Option<String>,

    /// Discard any saved progress and start over
    #[arg(long)]
    pub restart: bool,

    /// Stop after this many step invocations (progress is kept)
    #[arg(long)]
    pub max_calls: Option<u64>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Export one blog into a package
    Export {
        #[command(flatten)]
        job: JobArgs,

        /// Seal dump lines (needs SITEPORT_KEY or SITEPORT_PASSPHRASE)
        #[arg(long)]
        encrypt: bool,

        /// Tune batching for plugin/theme trees
        #[arg(long)]
        plugin: bool,
    },

    /// Import a package into one blog
    Import {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Run exactly one step invocation of a started migration
    Step {
        #[arg(value_enum)]
        mode: ModeArg,
        #[arg(long)]
        db: PathBuf,
        #[arg(long, default_value_t = 1)]
        blog: u64,
    },

    /// Print saved progress as JSON
    Status {
        #[arg(value_enum)]
        mode: ModeArg,
        #[arg(long, default_value_t = 1)]
        blog: u64,
    },

    /// Flag a migration as cancelled; the next step invocation clears it
    Cancel {
        #[arg(value_enum)]
        mode: ModeArg,
        #[arg(long, default_value_t = 1)]
        blog: u64,
    },

    /// List package contents
    List { package: PathBuf },

    /// Check every frame hash and the tail counters
    Verify { package: PathBuf },
}
