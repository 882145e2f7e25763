use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use inquire::{Password, Text};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{debug, warn};

use cityweather_core::{
    CityCatalog, CityId, CityWeatherAggregator, Config, FavoritesManager, RecordStore, UserId,
    filter_cities, store::memory::MemoryStore, store_from_config,
};

use crate::render::{self, RenderContext};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "cityweather", version, about = "Weather for your favorite cities")]
pub struct Cli {
    /// Act as this user instead of the configured session.
    #[arg(long, global = true)]
    pub user: Option<String>,

    /// Serve data from a JSON seed file instead of the configured store.
    #[arg(long, global = true, value_name = "FILE")]
    pub seed: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure the record store connection and the signed-in user.
    Configure,

    /// List cities, marking favorites.
    Cities {
        /// Case-insensitive filter on city name or country.
        #[arg(long, short)]
        search: Option<String>,
    },

    /// Show current weather and the forecast for one city.
    Show {
        /// City id.
        city_id: String,
    },

    /// Show weather for every favorite city.
    Dashboard,

    /// Add or remove a city from favorites.
    Favorite {
        /// City id.
        city_id: String,
    },
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        let Cli { user, seed, command } = self;
        let config = Config::load()?;

        match command {
            Command::Configure => configure(config),
            Command::Cities { search } => {
                let search = search.unwrap_or_default();
                Session::open(config, user, seed)?.cities(&search).await
            }
            Command::Show { city_id } => Session::open(config, user, seed)?.show(CityId::new(city_id)).await,
            Command::Dashboard => Session::open(config, user, seed)?.dashboard().await,
            Command::Favorite { city_id } => {
                Session::open(config, user, seed)?.favorite(CityId::new(city_id)).await
            }
        }
    }
}

fn configure(mut config: Config) -> anyhow::Result<()> {
    let current_url = config.store.as_ref().map(|s| s.url.clone()).unwrap_or_default();
    let url = Text::new("Project URL:")
        .with_initial_value(&current_url)
        .with_help_message("e.g. https://xyz.supabase.co")
        .prompt()?;
    let api_key = Password::new("API key:").without_confirmation().prompt()?;

    let current_user = config.session.as_ref().map(|s| s.user_id.clone()).unwrap_or_default();
    let user_id = Text::new("User id:").with_initial_value(&current_user).prompt()?;

    config.set_store(url.trim().to_string(), api_key.trim().to_string());
    if !user_id.trim().is_empty() {
        config.set_user(user_id.trim().to_string());
    }
    config.save()?;

    println!("Saved configuration to {}", Config::config_file_path()?.display());
    Ok(())
}

/// Resolved store and user for one command.
struct Session {
    store: Arc<dyn RecordStore>,
    user: Option<UserId>,
    timeout: Duration,
}

impl Session {
    fn open(config: Config, user: Option<String>, seed: Option<PathBuf>) -> anyhow::Result<Self> {
        let store: Arc<dyn RecordStore> = match seed {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read seed file: {}", path.display()))?;
                let doc: serde_json::Value = serde_json::from_str(&text)
                    .with_context(|| format!("Failed to parse seed file: {}", path.display()))?;
                debug!(path = %path.display(), "using in-memory store");
                Arc::new(MemoryStore::from_json(&doc)?)
            }
            None => store_from_config(&config)?,
        };

        let user = user.map(UserId::new).or_else(|| config.user_id().ok());
        let timeout = config.request_timeout();
        Ok(Self { store, user, timeout })
    }

    fn require_user(&self) -> anyhow::Result<&UserId> {
        self.user.as_ref().ok_or_else(|| {
            anyhow!(
                "No signed-in user.\n\
                 Hint: run `cityweather configure` or pass `--user <id>`."
            )
        })
    }

    fn catalog(&self) -> CityCatalog {
        CityCatalog::new(self.store.clone()).with_deadline(self.timeout)
    }

    fn favorites(&self) -> FavoritesManager {
        FavoritesManager::new(self.store.clone()).with_deadline(self.timeout)
    }

    fn aggregator(&self) -> CityWeatherAggregator {
        CityWeatherAggregator::new(self.store.clone()).with_deadline(self.timeout)
    }

    async fn cities(&self, search: &str) -> anyhow::Result<()> {
        let cities = self
            .catalog()
            .list()
            .await
            .map_err(|e| anyhow!("Failed to load cities: {}", e.user_message()))?;

        let favorites = self.favorites();
        if let Some(user) = &self.user {
            favorites.hydrate_best_effort(user).await;
        }

        let shown = filter_cities(&cities, search);
        print!("{}", render::city_list(&shown, |c| favorites.is_favorite(&c.id), search));
        Ok(())
    }

    async fn show(&self, city_id: CityId) -> anyhow::Result<()> {
        let view = self
            .aggregator()
            .assemble_one(&city_id)
            .await
            .map_err(|e| anyhow!("Failed to load city data: {}", e.user_message()))?;

        let favorite = match &self.user {
            Some(user) => match self.favorites().refresh_one(user, &city_id).await {
                Ok(member) => Some(member),
                Err(e) => {
                    warn!(city = %city_id, error = %e, "favorite status unavailable");
                    None
                }
            },
            None => None,
        };

        print!("{}", render::city_detail(&view, favorite, &RenderContext::local()));
        Ok(())
    }

    async fn dashboard(&self) -> anyhow::Result<()> {
        let user = self.require_user()?;
        let ids = self
            .catalog()
            .favorite_cities(user)
            .await
            .map_err(|e| anyhow!("Failed to load favorites: {}", e.user_message()))?;

        let entries = self.aggregator().assemble_many(&ids).await;
        print!("{}", render::dashboard(&entries, &RenderContext::local()));
        Ok(())
    }

    async fn favorite(&self, city_id: CityId) -> anyhow::Result<()> {
        let user = self.require_user()?;
        let favorites = self.favorites();

        let result = match favorites.refresh_one(user, &city_id).await {
            Ok(_) => favorites.toggle_favorite(user, &city_id).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(true) => println!("Added to favorites"),
            Ok(false) => println!("Removed from favorites"),
            Err(e) => return Err(anyhow!("Failed to update favorites: {}", e.user_message())),
        }
        Ok(())
    }
}
