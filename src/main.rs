//! authchain-mc - Minecraft account manager
//!
//! Signs Microsoft accounts in through the browser, keeps a list of
//! accounts and turns any of them into a game session.

mod settings;

use std::sync::Arc;
use std::time::Duration;

use ac_accounts::{
    Account, AccountContext, AccountStore, ExternalAccount, ExternalStrategy, InventoryClient,
    PickOutcome, RefreshTokenAccount, SessionTokenAccount, StopFlag, pick_external_account,
};
use ac_auth::{LoginChain, RedirectListener, ReqwestTransport, Transport};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::settings::Settings;

/// How long to wait for the browser to come back with a code
const LOGIN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "authchain-mc")]
#[command(about = "Microsoft account login chain for Minecraft", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with a Microsoft account through the browser
    Login,

    /// Add an account from an existing Minecraft session token
    AddSession { token: String },

    /// Add an account held by the account inventory
    AddExternal {
        id: String,

        /// Let the inventory mint the Minecraft token instead of running the login chain
        #[arg(long)]
        derived: bool,
    },

    /// List saved accounts
    List,

    /// Remove a saved account
    Remove { index: usize },

    /// Log an account in and print its session
    Play { index: usize },

    /// Sign in to the account inventory with a quick-login code
    InventoryLogin { code: String },

    /// List accounts available in the inventory
    InventoryList,

    /// Add a random working account from the inventory
    Pick {
        /// Maximum number of accounts to try
        #[arg(short, long, default_value = "10")]
        tries: usize,
    },
}

struct App {
    ctx: AccountContext,
    store: AccountStore,
}

impl App {
    async fn new(settings: &Settings) -> Result<Self> {
        let auth_config = settings.auth_config();
        let transport: Arc<dyn Transport> = Arc::new(
            ReqwestTransport::new(&auth_config).context("Failed to build HTTP client")?,
        );
        let chain = LoginChain::with_transport(auth_config, Arc::clone(&transport));

        let secrets = settings.vault_config()?.open();
        let inventory = InventoryClient::new(&settings.inventory_base_url, transport, secrets);
        if !inventory.load_saved_token().await? {
            info!("Not signed in to the account inventory");
        }

        let store = AccountStore::load(&settings.accounts_path()?).await?;
        Ok(Self {
            ctx: AccountContext::new(chain, Some(inventory)),
            store,
        })
    }

    fn inventory(&self) -> Result<&InventoryClient> {
        self.ctx
            .inventory
            .as_ref()
            .context("Account inventory is not available")
    }

    /// Load a new account and keep it if that worked, or if it holds a
    /// rotated refresh token that would otherwise be lost
    async fn add(&mut self, mut account: Account) -> Result<()> {
        if let Err(e) = account.fetch_info(&self.ctx).await {
            let kind = account.kind();
            if account.keep_after_failed_load(&e) {
                if self.store.add(account) {
                    self.store.save().await?;
                }
                warn!("Saved the account without profile details, load it later with `play`");
            }
            return Err(e).with_context(|| format!("Failed to load {kind} account"));
        }

        let label = describe(&account);
        if self.store.add(account) {
            self.store.save().await?;
            println!("Added {label}");
        } else {
            println!("Already added: {label}");
        }
        Ok(())
    }

    async fn login(&mut self) -> Result<()> {
        let listener = RedirectListener::for_chain(self.ctx.chain.clone());
        let (addr, token_rx) = listener.capture_refresh_token().await?;
        let url = self.ctx.chain.authorize_url()?;

        info!(%addr, "Waiting for the browser redirect");
        println!("Opening browser. If nothing happens, visit:\n{url}");
        if let Err(e) = open::that(url.as_str()) {
            warn!(error = %e, "Failed to open browser");
        }

        let received = tokio::time::timeout(LOGIN_TIMEOUT, token_rx).await;
        listener.stop();

        let refresh_token = match received {
            Ok(Ok(Some(token))) => token,
            Ok(Ok(None)) => bail!("Microsoft sign-in did not return a usable code"),
            Ok(Err(_)) => bail!("Redirect listener stopped before sign-in finished"),
            Err(_) => bail!("Timed out waiting for Microsoft sign-in"),
        };

        self.add(RefreshTokenAccount::new(refresh_token).into()).await
    }

    fn list(&self) {
        if self.store.accounts().is_empty() {
            println!("No accounts");
            return;
        }
        for (index, account) in self.store.accounts().iter().enumerate() {
            println!("{index:>3}  {}", describe(account));
        }
    }

    async fn play(&mut self, index: usize) -> Result<()> {
        let account = self.store.get_mut(index)?;
        let result = account.login(&self.ctx).await;

        // a refresh token may have rotated even if the login failed
        self.store.save().await?;

        let session = result.context("Login failed")?;
        println!("Username:     {}", session.username);
        println!("UUID:         {}", session.uuid);
        println!("User type:    {}", ac_accounts::GameSession::USER_TYPE);
        Ok(())
    }

    async fn inventory_list(&self) -> Result<()> {
        let inventory = self.inventory()?;
        let accounts = inventory.list_accounts().await?;
        if let Some(user) = inventory.user().await {
            println!("Signed in as {} ({})", user.name, user.id);
        }

        let added = self.store.external_ids();
        for account in &accounts {
            let marker = if added.contains(&account.id) { "*" } else { " " };
            println!(
                "{marker} {}  {}",
                account.id,
                account.combo.as_deref().unwrap_or("")
            );
        }
        println!("{} accounts, {} added", accounts.len(), added.len());
        Ok(())
    }

    async fn pick(&mut self, tries: usize) -> Result<()> {
        let stop = StopFlag::new();
        let watcher = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                watcher.stop();
            }
        });

        let existing = self.store.external_ids();
        match pick_external_account(&self.ctx, &existing, tries, &stop).await? {
            PickOutcome::Picked(account) => {
                let label = describe(&account);
                self.store.add(account);
                self.store.save().await?;
                println!("Added {label}");
            }
            PickOutcome::RateLimited => {
                bail!("Minecraft login is rate limited, wait about two minutes and try again")
            }
            PickOutcome::Exhausted => bail!("No working account found after {tries} tries"),
            PickOutcome::Stopped => println!("Stopped"),
        }
        Ok(())
    }
}

fn describe(account: &Account) -> String {
    let name = match account.username() {
        "" => "<unknown>",
        name => name,
    };
    format!("{:<14} {:<16} {}", account.kind(), name, account.uuid())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let settings = Settings::load(&Settings::default_path()?).await?;
    let mut app = App::new(&settings).await?;

    match cli.command {
        Commands::Login => app.login().await?,
        Commands::AddSession { token } => app.add(SessionTokenAccount::new(token).into()).await?,
        Commands::AddExternal { id, derived } => {
            let strategy = if derived {
                ExternalStrategy::DerivedAccessToken
            } else {
                ExternalStrategy::RefreshChain
            };
            app.add(ExternalAccount::new(id).with_strategy(strategy).into())
                .await?
        }
        Commands::List => app.list(),
        Commands::Remove { index } => {
            let removed = app.store.remove(index)?;
            app.store.save().await?;
            app.ctx.clear_external_cache(removed.identity());
            println!("Removed {}", describe(&removed));
        }
        Commands::Play { index } => app.play(index).await?,
        Commands::InventoryLogin { code } => {
            let inventory = app.inventory()?;
            inventory.quick_login(&code).await?;
            match inventory.user().await {
                Some(user) => println!("Signed in as {}", user.name),
                None => println!("Signed in"),
            }
        }
        Commands::InventoryList => app.inventory_list().await?,
        Commands::Pick { tries } => app.pick(tries).await?,
    }

    Ok(())
}
