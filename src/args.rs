use clap::{Parser, Subcommand};

/// Independent tabulation of paper ballots from their scanned images, compared
/// with the cast vote records of the voting system.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,

    // Other arguments
    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Runs one or more operations of a job, in the order given.
    Run {
        /// (file path) The JSON document with the settings of the job.
        #[clap(short, long, value_parser)]
        settings: String,

        /// (operation name, repeatable) The operations to run, for example
        /// genbif_from_ballots, gentemplates, extractvote or cmpcvr_and_report.
        /// Overrides the `op` key of the settings.
        #[clap(long = "op", value_parser)]
        ops: Vec<String>,

        /// (local directory or s3:// prefix) Overrides the `job_root` key of the settings.
        #[clap(long, value_parser)]
        job_root: Option<String>,

        /// (key=value, repeatable) Overrides one key of the settings. The value is read
        /// as JSON when it parses, as a string otherwise.
        #[clap(long = "set", value_parser)]
        overrides: Vec<String>,
    },
    /// Runs a single task. The request is read as JSON from the standard input.
    /// This is how the delegate processes of a job are started.
    Worker,
    /// Prints the state of a job as JSON.
    Status {
        /// (file path) The JSON document with the settings of the job.
        #[clap(short, long, value_parser)]
        settings: String,

        #[clap(long, value_parser)]
        job_root: Option<String>,
    },
}
