//! `cvault` command line.

use crate::config::RepoConfig;
use crate::merge::ConflictPolicy;
use crate::repository::{MergeOutcome, Repository};
use anyhow::{Context, Result};
use chunkvault_store::{ContentHasher, EncryptionKey, HashValue, StoreRegistry};
use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "cvault")]
#[command(about = "Content-addressed versioned file store", long_about = None)]
pub struct Cli {
    /// Repository directory
    #[arg(short, long, env = "CVAULT_REPO", default_value = ".")]
    pub repo: PathBuf,

    /// Repository config file (.toml or .json)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Hex-encoded 32-byte encryption key
    #[arg(short, long, env = "CVAULT_KEY", hide_env_values = true)]
    pub key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the repository
    Init,
    /// Store a file in the working tree, reading stdin when no source is given
    Put {
        path: String,
        source: Option<PathBuf>,
    },
    /// Print a file
    Cat {
        path: String,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Remove a file or directory
    Rm {
        path: String,
    },
    /// Commit the working tree
    Commit {
        #[arg(short, long)]
        message: String,
    },
    /// Show history from head
    Log {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Changed paths between two commits
    Diff {
        base: String,
        end: String,
        #[arg(long)]
        json: bool,
    },
    /// Content hash of a local file without storing it
    Hash {
        file: PathBuf,
    },
    /// Merge the head of another repository sharing the same key
    Merge {
        #[arg(long)]
        from: PathBuf,
        #[arg(long, value_enum)]
        policy: Option<ConflictPolicy>,
    },
    /// Store statistics
    Stats,
}

impl Cli {
    /// Execute the parsed command
    pub fn run(self) -> Result<()> {
        let registry = StoreRegistry::new();
        match self.command {
            Command::Init => {
                let repo = Repository::init(&registry, &self.repo, self.load_config()?, self.key()?)?;
                println!("Initialized repository in {}", repo.dir().display());
                Ok(())
            }
            Command::Put { ref path, ref source } => {
                let data = match source {
                    Some(file) => std::fs::read(file)
                        .with_context(|| format!("reading {}", file.display()))?,
                    None => {
                        let mut buf = Vec::new();
                        std::io::stdin().read_to_end(&mut buf)?;
                        buf
                    }
                };
                let repo = self.open(&registry)?;
                repo.write_bytes(path, &data)?;
                let commit = repo.commit(&format!("put {}", path))?;
                report_commit(commit);
                Ok(())
            }
            Command::Cat { ref path } => {
                let data = self.open(&registry)?.read_bytes(path)?;
                std::io::stdout().write_all(&data)?;
                Ok(())
            }
            Command::Ls { ref path } => {
                let repo = self.open(&registry)?;
                for dir in repo.list_directories(path)? {
                    println!("{}/", dir);
                }
                for file in repo.list_files(path)? {
                    println!("{}", file);
                }
                Ok(())
            }
            Command::Rm { ref path } => {
                let repo = self.open(&registry)?;
                repo.remove(path)?;
                report_commit(repo.commit(&format!("rm {}", path))?);
                Ok(())
            }
            Command::Commit { ref message } => {
                report_commit(self.open(&registry)?.commit(message)?);
                Ok(())
            }
            Command::Log { limit } => self.log(&registry, limit),
            Command::Diff {
                ref base,
                ref end,
                json,
            } => self.diff(&registry, base, end, json),
            Command::Hash { ref file } => {
                let config = self.load_config()?;
                let mut hasher = ContentHasher::new(config.store.tree.splitter);
                let mut input = std::fs::File::open(file)
                    .with_context(|| format!("opening {}", file.display()))?;
                std::io::copy(&mut input, &mut hasher)?;
                println!("{}  {}", hasher.finish(), file.display());
                Ok(())
            }
            Command::Merge { ref from, policy } => self.merge(&registry, from, policy),
            Command::Stats => {
                let repo = self.open(&registry)?;
                let stats = repo.store_stats();
                println!("Revision: {}", repo.revision());
                println!("Chunks: {}", stats.entries);
                println!("Pack bytes: {}", stats.pack_bytes);
                println!("Dedup hits: {}", stats.dedup_hits);
                Ok(())
            }
        }
    }

    fn load_config(&self) -> Result<RepoConfig> {
        match &self.config {
            Some(path) => Ok(RepoConfig::from_file(path)?),
            None => Ok(RepoConfig::default()),
        }
    }

    fn key(&self) -> Result<Option<EncryptionKey>> {
        let Some(text) = &self.key else {
            return Ok(None);
        };
        let bytes = hex::decode(text.trim()).context("key must be hex")?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("key must be 32 bytes"))?;
        Ok(Some(EncryptionKey(key)))
    }

    fn open(&self, registry: &StoreRegistry) -> Result<Repository> {
        self.open_at(registry, &self.repo, self.load_config()?)
    }

    fn open_at(&self, registry: &StoreRegistry, dir: &Path, config: RepoConfig) -> Result<Repository> {
        Repository::open(registry, dir, config, self.key()?)
            .with_context(|| format!("opening repository {}", dir.display()))
    }

    fn log(&self, registry: &StoreRegistry, limit: Option<usize>) -> Result<()> {
        let repo = self.open(registry)?;
        let history = repo.history()?;
        for record in history.iter().take(limit.unwrap_or(usize::MAX)) {
            println!("commit {}", record.hash());
            if record.commit.parents.len() > 1 {
                let parents: Vec<String> = record
                    .commit
                    .parents
                    .iter()
                    .map(|p| p.data_hash.to_hex())
                    .collect();
                println!("Merge: {}", parents.join(" "));
            }
            println!("    {}", record.commit.message_text());
            println!();
        }
        Ok(())
    }

    fn diff(&self, registry: &StoreRegistry, base: &str, end: &str, json: bool) -> Result<()> {
        let repo = self.open(registry)?;
        let base = HashValue::from_hex(base).context("base must be a commit hash")?;
        let end = HashValue::from_hex(end).context("end must be a commit hash")?;
        let entries = repo.get_diff(&base, &end)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }
        for entry in entries {
            let marker = match entry.kind {
                crate::diff::ChangeKind::Added => 'A',
                crate::diff::ChangeKind::Removed => 'D',
                crate::diff::ChangeKind::Modified => 'M',
            };
            let suffix = if entry.is_file { "" } else { "/" };
            println!("{}  {}{}", marker, entry.path, suffix);
        }
        Ok(())
    }

    fn merge(&self, registry: &StoreRegistry, from: &Path, policy: Option<ConflictPolicy>) -> Result<()> {
        let mut config = self.load_config()?;
        if let Some(policy) = policy {
            config.conflict_policy = policy;
        }
        let other = self.open_at(registry, from, config.clone())?;
        let Some(other_head) = other.head() else {
            anyhow::bail!("{} has no commits", from.display());
        };
        let repo = self.open_at(registry, &self.repo, config)?;
        match repo.merge(&other.accessor(), &other_head)? {
            MergeOutcome::FastForward(head) => println!("Fast-forward to {}", head.data_hash),
            MergeOutcome::Merged(head) => {
                let stats = repo.last_merge_stats();
                println!("Merged into {} ({} conflicts)", head.data_hash, stats.conflicts);
            }
            MergeOutcome::UncommittedChanges => anyhow::bail!("working tree has uncommitted changes"),
        }
        Ok(())
    }
}

fn report_commit(commit: Option<chunkvault_store::BoxPointer>) {
    match commit {
        Some(pointer) => println!("Committed {}", pointer.data_hash),
        None => println!("Nothing to commit"),
    }
}
