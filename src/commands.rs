use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::Subcommand;
use log::info;

use crate::config::{Config, parse_interval};
use crate::db::Database;
use crate::error::StoreError;
use crate::feed::Fetcher;
use crate::models::User;
use crate::scheduler::Scheduler;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create a user and log in as them
    Register { name: String },
    /// Switch the current user
    Login { name: String },
    /// Delete every user, feed, follow and post
    Reset,
    /// List users
    Users,
    /// Fetch feeds on a timer until interrupted
    Agg {
        /// Time between cycles, e.g. `30s`, `5m`, `1h`
        interval: Option<String>,
    },
    /// Add a feed and follow it
    #[command(name = "addfeed")]
    AddFeed { name: String, url: String },
    /// List every feed
    Feeds,
    /// Follow an existing feed by URL
    Follow { url: String },
    /// List the feeds the current user follows
    Following,
    /// Stop following a feed
    Unfollow { url: String },
    /// Show the newest posts from followed feeds
    Browse {
        #[arg(default_value_t = 2)]
        limit: i64,
    },
}

pub struct State {
    pub db: Database,
    pub config: Config,
    pub config_path: PathBuf,
}

impl State {
    pub fn new(db: Database, config: Config, config_path: PathBuf) -> Self {
        Self {
            db,
            config,
            config_path,
        }
    }

    /// The logged-in user from the config file.
    pub async fn current_user(&self) -> Result<User> {
        let name = self
            .config
            .current_user_name
            .as_deref()
            .ok_or_else(|| anyhow!("no user logged in, run `gator login <name>` first"))?;

        self.db
            .get_user(name)
            .await
            .with_context(|| format!("current user '{}' is not registered", name))
    }
}

pub async fn run<W: Write>(state: &mut State, command: Command, out: &mut W) -> Result<()> {
    match command {
        Command::Register { name } => {
            let user = match state.db.create_user(&name).await {
                Err(StoreError::Constraint(_)) => bail!("user '{}' already exists", name),
                other => other?,
            };
            state.config.set_user(&user.name, &state.config_path)?;
            info!("Registered user {} ({})", user.name, user.id);
            writeln!(out, "User {} created and logged in", user.name)?;
        }

        Command::Login { name } => {
            let user = state
                .db
                .get_user(&name)
                .await
                .with_context(|| format!("cannot log in as '{}'", name))?;
            state.config.set_user(&user.name, &state.config_path)?;
            writeln!(out, "Logged in as {}", user.name)?;
        }

        Command::Reset => {
            let removed = state.db.delete_users().await?;
            writeln!(out, "Removed {} user(s) and everything they owned", removed)?;
        }

        Command::Users => {
            let current = state.config.current_user_name.as_deref();
            for user in state.db.get_users().await? {
                if Some(user.name.as_str()) == current {
                    writeln!(out, "* {} (current)", user.name)?;
                } else {
                    writeln!(out, "* {}", user.name)?;
                }
            }
        }

        Command::Agg { interval } => {
            let aggregator = &state.config.aggregator;
            let mut scheduler_config = aggregator.scheduler_config();
            if let Some(interval) = interval {
                scheduler_config.interval = parse_interval(&interval)?;
            }

            let fetcher = Fetcher::new(&aggregator.user_agent, aggregator.fetch_timeout())
                .context("failed to build HTTP client")?;
            let scheduler = Scheduler::new(state.db.clone(), fetcher, scheduler_config);

            writeln!(
                out,
                "Collecting feeds every {:?}, press Ctrl-C to stop",
                scheduler.config().interval
            )?;
            out.flush()?;

            let handle = scheduler.stop_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, finishing the current cycle");
                    handle.stop();
                }
            });

            scheduler.run().await?;
        }

        Command::AddFeed { name, url } => {
            let user = state.current_user().await?;
            let feed = match state.db.create_feed(&name, &url, user.id).await {
                Err(StoreError::Constraint(_)) => bail!("a feed with URL {} already exists", url),
                other => other?,
            };
            state.db.create_feed_follow(user.id, feed.id).await?;

            writeln!(out, "Added feed {} ({})", feed.name, feed.url)?;
            writeln!(out, "{} is now following it", user.name)?;
        }

        Command::Feeds => {
            for entry in state.db.get_feeds().await? {
                writeln!(out, "* {}", entry.feed.name)?;
                writeln!(out, "  URL:      {}", entry.feed.url)?;
                writeln!(out, "  Added by: {}", entry.owner_name)?;
                match entry.feed.last_fetched_at {
                    Some(at) => writeln!(out, "  Fetched:  {}", at.format("%Y-%m-%d %H:%M:%S"))?,
                    None => writeln!(out, "  Fetched:  never")?,
                }
            }
        }

        Command::Follow { url } => {
            let user = state.current_user().await?;
            let feed = state
                .db
                .get_feed_by_url(&url)
                .await
                .with_context(|| format!("no feed with URL {}, add it with `addfeed`", url))?;
            let follow = match state.db.create_feed_follow(user.id, feed.id).await {
                Err(StoreError::Constraint(_)) => bail!("{} already follows {}", user.name, url),
                other => other?,
            };

            writeln!(out, "{} is now following {}", follow.user_name, follow.feed_name)?;
        }

        Command::Following => {
            let user = state.current_user().await?;
            for follow in state.db.get_feed_follows_for_user(user.id).await? {
                writeln!(out, "* {}", follow.feed_name)?;
            }
        }

        Command::Unfollow { url } => {
            let user = state.current_user().await?;
            let feed = state.db.get_feed_by_url(&url).await?;
            if !state.db.delete_feed_follow(user.id, feed.id).await? {
                bail!("{} does not follow {}", user.name, url);
            }
            writeln!(out, "{} unfollowed {}", user.name, feed.name)?;
        }

        Command::Browse { limit } => {
            let user = state.current_user().await?;
            let posts = state.db.get_posts_for_user(user.id, limit.max(1)).await?;
            if posts.is_empty() {
                writeln!(out, "No posts yet, run `gator agg` to collect some")?;
            }
            for post in posts {
                let date = post
                    .published_at
                    .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "undated".to_string());
                writeln!(out, "{}  {}", date, post.title)?;
                writeln!(out, "    {}", post.url)?;
                if let Some(description) = post.description {
                    writeln!(out, "    {}", description)?;
                }
            }
        }
    }

    Ok(())
}
