use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use reelcast::config::ClientConfig;
use reelcast::drainer::DisplayState;
use reelcast::favorites::HttpFavoritesApi;
use reelcast::session::{Credential, Identity, StaticCredentialProvider};
use reelcast::types::{FavoriteRecord, MovieId};
use reelcast::{ClientError, NotificationClient};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("waiting for ctrl-c failed: {0}")]
    Signal(#[from] std::io::Error),
}

impl From<reelcast::config::ConfigError> for CliError {
    fn from(error: reelcast::config::ConfigError) -> Self {
        Self::Client(error.into())
    }
}

impl From<reelcast::favorites::FavoritesError> for CliError {
    fn from(error: reelcast::favorites::FavoritesError) -> Self {
        Self::Client(error.into())
    }
}

#[derive(Parser, Debug)]
#[command(name = "reelcast", about = "Movie favorites notification client")]
struct Cli {
    /// User id embedded in the notification URL.
    #[arg(long, env = "REELCAST_USER_ID")]
    user_id: String,

    /// Name shown to other users when you add a favorite.
    #[arg(long, env = "REELCAST_USER_NAME")]
    user_name: Option<String>,

    /// Bearer token for the notification socket and favorites API.
    #[arg(long, env = "REELCAST_TOKEN", hide_env_values = true)]
    token: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and print notifications until ctrl-c.
    Listen,
    Favorites(FavoritesCommand),
}

#[derive(Args, Debug)]
struct FavoritesCommand {
    #[command(subcommand)]
    command: FavoritesSubcommand,
}

#[derive(Subcommand, Debug)]
enum FavoritesSubcommand {
    List,
    Add {
        movie_id: i64,
        #[arg(long)]
        title: String,
    },
    Remove {
        movie_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env()?;
    let api = Arc::new(HttpFavoritesApi::new(&config.api_base_url, config.http)?);
    let provider = Arc::new(StaticCredentialProvider::new(Credential::new(cli.token), config.credential_ttl));
    let client = NotificationClient::new(config, provider, api);

    let display_name = cli.user_name.unwrap_or_else(|| cli.user_id.clone());
    client.login(Identity::new(cli.user_id, display_name)).await?;

    let result = match cli.command {
        Command::Listen => run_listen(&client).await,
        Command::Favorites(favorites) => run_favorites(&client, favorites).await,
    };
    client.logout();
    result
}

async fn run_listen(client: &NotificationClient) -> Result<(), CliError> {
    let mut displayed = client.displayed();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                eprintln!("disconnecting");
                return Ok(());
            }
            changed = displayed.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = displayed.borrow_and_update().clone();
                if let DisplayState::Displaying { message } = state {
                    println!("{message}");
                }
            }
        }
    }
}

async fn run_favorites(client: &NotificationClient, favorites: FavoritesCommand) -> Result<(), CliError> {
    let sync = client.favorites();
    match favorites.command {
        FavoritesSubcommand::List => {
            sync.refetch().await?;
            let rendered = serde_json::to_string_pretty(&sync.favorites())?;
            println!("{rendered}");
        }
        FavoritesSubcommand::Add { movie_id, title } => {
            sync.refetch().await?;
            sync.add_favorite(&FavoriteRecord::new(movie_id, title)).await?;
            eprintln!("added {movie_id}; {} favorites", sync.favorites().len());
        }
        FavoritesSubcommand::Remove { movie_id } => {
            sync.refetch().await?;
            let movie = sync
                .favorites()
                .into_iter()
                .find(|record| record.movie_id == MovieId(movie_id))
                .unwrap_or_else(|| FavoriteRecord::new(movie_id, String::new()));
            sync.remove_favorite(&movie).await?;
            eprintln!("removed {movie_id}; {} favorites", sync.favorites().len());
        }
    }
    Ok(())
}
