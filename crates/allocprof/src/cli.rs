use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "allocprof")]
#[command(about = "Offline tooling for sampled allocation stacks")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Merge sampled stacks into per-stack byte totals for flame graphs
    Collapse {
        /// Sampled stacks written by a flame or lifetime session
        #[arg(default_value = "stacks.txt")]
        input: PathBuf,

        /// Start stacks at the first frame containing this (case-insensitive)
        filter: Option<String>,

        /// Collapsed output file
        #[arg(long, short = 'o', default_value = "collapsed.txt")]
        output: PathBuf,

        /// Drop stacks that do not contain the filter
        #[arg(long, requires = "filter")]
        exclusive: bool,

        /// Also print the N heaviest stacks
        #[arg(long, short = 'n')]
        top: Option<usize>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if let Command::Collapse { filter, top, .. } = &self.command {
            if filter.as_deref().is_some_and(|f| f.trim().is_empty()) {
                return Err("Filter must not be empty".to_string());
            }
            if *top == Some(0) {
                return Err("--top must be at least 1".to_string());
            }
        }
        Ok(())
    }
}
