//! Operator command line for the checkout settlement engine.
//!
//! # Usage
//!
//! ```bash
//! # Price a cart with a discount code against the live commerce API
//! cartsettle quote --cart cart.json --address address.json --discount TEN
//!
//! # Run a checkout and pay through the direct transfer rail
//! cartsettle pay --cart cart.json --address address.json --rail direct
//!
//! # Reopen a persisted session and retry order creation, or re-check an
//! # unconfirmed transfer
//! cartsettle recover --session 3f2a... --retry
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to TOML configuration file (default: `cartsettle.toml`)
//! - `COMMERCE_API_URL` - Override the commerce API URL
//! - `RUST_LOG` - Log level filter (default: `info`)

mod config;
mod session_file;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use alloy_network::EthereumWallet;
use alloy_primitives::Address;
use alloy_provider::{Provider, ProviderBuilder};
use cartsettle::aggregator::AggregatorRail;
use cartsettle::attempt::OrderId;
use cartsettle::cart::{Cart, LineItem, PostalAddress};
use cartsettle::discount::{AppliedDiscount, AppliedGiftCard};
use cartsettle::hooks::{
    CheckoutHooks, IdentityLostContext, MaterializationFailedContext, OrderCreatedContext,
};
use cartsettle::identity::Identity;
use cartsettle::orchestrator::{CheckoutServices, CheckoutState, Orchestrator};
use cartsettle::pricing::PriceBreakdown;
use cartsettle::proof::SettlementProof;
use cartsettle::rail::{PaymentRail, RailError};
use cartsettle::session::{CheckoutSession, MemorySessionStore, PendingSettlement, SessionStore};
use cartsettle::shipping::ShippingSelector;
use cartsettle::BoxFuture;
use cartsettle_evm::claim::rewards::{
    DistributorSubmitter, PermitSource, RewardClaimer, RewardSubmitter,
};
use cartsettle_evm::claim::signer::LocalClaimSigner;
use cartsettle_evm::{DirectTransferRail, SignatureClaimRail};
use cartsettle_http::{AggregatorClient, ApiClient, CommerceClient};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::config::{ChainConfig, Config};
use crate::session_file::FileSessionStore;

#[derive(Debug, Parser)]
#[command(name = "cartsettle", version, about = "Price carts and settle checkout payments")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Price a cart, validating codes and shipping against the commerce API.
    Quote(QuoteArgs),
    /// Run a checkout to completion through one payment rail.
    Pay(PayArgs),
    /// Reopen a persisted session and surface or retry pending settlements.
    Recover(RecoverArgs),
}

#[derive(Debug, Args)]
struct CheckoutArgs {
    /// Cart file (JSON with `items`, optional `currency` and `notes`).
    #[arg(long)]
    cart: Option<PathBuf>,
    /// Shipping address file (JSON).
    #[arg(long)]
    address: Option<PathBuf>,
    /// Discount code to apply.
    #[arg(long)]
    discount: Option<String>,
    /// Gift-card code to apply.
    #[arg(long)]
    gift_card: Option<String>,
    /// Shipping rate handle, when manual selection is configured.
    #[arg(long)]
    shipping: Option<String>,
    /// Identity recorded on the order.
    #[arg(long, env = "CARTSETTLE_IDENTITY")]
    identity: Option<u64>,
}

#[derive(Debug, Args)]
struct QuoteArgs {
    #[command(flatten)]
    checkout: CheckoutArgs,
}

#[derive(Debug, Args)]
struct PayArgs {
    #[command(flatten)]
    checkout: CheckoutArgs,
    /// Payment rail.
    #[arg(long, value_enum)]
    rail: RailKind,
    /// Session id; an existing session is resumed.
    #[arg(long)]
    session: Option<String>,
}

#[derive(Debug, Args)]
struct RecoverArgs {
    /// Session id.
    #[arg(long)]
    session: String,
    /// Retry order creation for a settlement whose order failed.
    #[arg(long)]
    retry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RailKind {
    /// ERC-20 transfer from the configured payer.
    Direct,
    /// Cross-chain aggregator payment.
    Aggregator,
    /// Signed zero-value claim.
    Claim,
}

/// Cart file contents.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CartFile {
    #[serde(default)]
    currency: Option<String>,
    items: Vec<LineItem>,
    #[serde(default)]
    notes: String,
}

/// What each command prints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report<'a> {
    session: &'a str,
    state: &'a CheckoutState,
    breakdown: PriceBreakdown,
    #[serde(skip_serializing_if = "Option::is_none")]
    discount: Option<&'a AppliedDiscount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gift_card: Option<&'a AppliedGiftCard>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    pending: &'a [PendingSettlement],
}

impl<'a> Report<'a> {
    fn of(orchestrator: &'a Orchestrator) -> Self {
        let session = orchestrator.session();
        Self {
            session: &session.id,
            state: orchestrator.state(),
            breakdown: orchestrator.breakdown(),
            discount: orchestrator.cart().discount(),
            gift_card: orchestrator.cart().gift_card(),
            pending: &session.pending,
        }
    }

    #[allow(clippy::print_stdout)]
    fn emit(&self) -> Result<(), serde_json::Error> {
        println!("{}", serde_json::to_string_pretty(self)?);
        Ok(())
    }
}

/// Logs checkout lifecycle events.
#[derive(Debug, Clone, Copy)]
struct LogHooks;

impl CheckoutHooks for LogHooks {
    fn after_order_created<'a>(&'a self, ctx: &'a OrderCreatedContext) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::info!(
                session = %ctx.session_id,
                order_id = %ctx.order_id,
                order = %ctx.order.id,
                method = %ctx.method,
                proof = %ctx.proof,
                "Order created"
            );
        })
    }

    fn on_identity_lost<'a>(&'a self, ctx: &'a IdentityLostContext) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::warn!(
                session = %ctx.session_id,
                order_id = %ctx.order_id,
                "Identity lost; order proceeds anonymously"
            );
        })
    }

    fn on_materialization_failed<'a>(
        &'a self,
        ctx: &'a MaterializationFailedContext,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::error!(
                session = %ctx.session_id,
                order_id = %ctx.order_id,
                proof = %ctx.proof,
                error = %ctx.error,
                "Payment settled but no order was created; keep the proof for support"
            );
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("cartsettle failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = Config::load()?;
    tracing::info!(
        commerce = %config.commerce.url,
        manual_shipping = config.checkout.manual_shipping,
        "Loaded configuration"
    );

    let api = ApiClient::parse(&config.commerce.url)?.with_timeout(config.commerce.timeout());
    let commerce = Arc::new(CommerceClient::try_new(api)?);

    match cli.command {
        Command::Quote(args) => quote(&config, commerce, args).await,
        Command::Pay(args) => pay(&config, commerce, args).await,
        Command::Recover(args) => recover(&config, commerce, args).await,
    }
}

fn build_orchestrator(
    config: &Config,
    commerce: Arc<CommerceClient>,
    sessions: Arc<dyn SessionStore>,
    session: CheckoutSession,
) -> Orchestrator {
    Orchestrator::new(session, CheckoutServices::from_commerce(commerce, sessions))
        .with_selector(ShippingSelector::new().with_manual_selection(config.checkout.manual_shipping))
        .with_hook(LogHooks)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn Error>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    Ok(serde_json::from_str(&text)?)
}

async fn load_cart(config: &Config, args: &CheckoutArgs) -> Result<Cart, Box<dyn Error>> {
    let path = args.cart.as_deref().ok_or("--cart is required for a new checkout")?;
    let file: CartFile = read_json(path).await?;
    let currency = file
        .currency
        .unwrap_or_else(|| config.checkout.currency.clone());
    let mut cart = Cart::from_items(currency, file.items)?;
    cart.set_notes(file.notes);
    Ok(cart)
}

/// Applies codes, starts checkout and walks the shipping steps as far as the
/// arguments allow.
async fn advance(orchestrator: &mut Orchestrator, args: &CheckoutArgs) -> Result<(), Box<dyn Error>> {
    if let Some(id) = args.identity {
        orchestrator.set_identity(Some(Identity::from_u64(id)));
    }
    if let Some(code) = &args.discount {
        let applied = orchestrator.apply_discount(code).await?;
        tracing::info!(code = %applied.code, kind = ?applied.kind, value = %applied.value, "Discount applied");
    }
    if let Some(code) = &args.gift_card {
        let applied = orchestrator.apply_gift_card(code).await?;
        tracing::info!(balance = %applied.balance, "Gift card applied");
    }
    if *orchestrator.state() == CheckoutState::Idle {
        orchestrator.start().await?;
    }
    if matches!(orchestrator.state(), CheckoutState::Shipping { .. }) {
        if let Some(path) = &args.address {
            let address: PostalAddress = read_json(path).await?;
            orchestrator.submit_address(address).await?;
        }
    }
    if matches!(orchestrator.state(), CheckoutState::ShippingMethod { .. }) {
        if let Some(handle) = &args.shipping {
            orchestrator.choose_shipping(handle).await?;
        }
    }
    Ok(())
}

async fn quote(
    config: &Config,
    commerce: Arc<CommerceClient>,
    args: QuoteArgs,
) -> Result<(), Box<dyn Error>> {
    let cart = load_cart(config, &args.checkout).await?;
    let sessions: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let session = CheckoutSession::new(OrderId::generate().as_str(), cart);
    let mut orchestrator = build_orchestrator(config, commerce, sessions, session);

    advance(&mut orchestrator, &args.checkout).await?;
    Report::of(&orchestrator).emit()?;
    Ok(())
}

async fn pay(
    config: &Config,
    commerce: Arc<CommerceClient>,
    args: PayArgs,
) -> Result<(), Box<dyn Error>> {
    let store = Arc::new(FileSessionStore::new(&config.checkout.session_dir));
    let session_id = args
        .session
        .clone()
        .unwrap_or_else(|| OrderId::generate().as_str().to_owned());
    let existing = store.load(&session_id).await?;
    let resumed = existing.is_some();
    let session = match existing {
        Some(session) => session,
        None => CheckoutSession::new(session_id, load_cart(config, &args.checkout).await?),
    };

    let rail = build_rail(args.rail, config, &commerce)?;
    let sessions: Arc<dyn SessionStore> = store;
    let mut orchestrator = build_orchestrator(config, commerce, sessions, session);

    if resumed {
        tracing::info!(session = %orchestrator.session().id, "Resuming session");
        orchestrator.reopen().await?;
        if orchestrator.state().is_terminal() {
            Report::of(&orchestrator).emit()?;
            return Ok(());
        }
        if let Some(pending) = orchestrator.session().unconfirmed() {
            let message = format!(
                "payment {} is still unconfirmed; run `cartsettle recover --session {} --retry`",
                pending.proof,
                orchestrator.session().id
            );
            Report::of(&orchestrator).emit()?;
            return Err(message.into());
        }
        orchestrator.restore_codes().await?;
    }

    advance(&mut orchestrator, &args.checkout).await?;
    if *orchestrator.state() != CheckoutState::Payment {
        Report::of(&orchestrator).emit()?;
        return Err(format!(
            "checkout stopped at {}; supply --address or --shipping to continue",
            orchestrator.state().name()
        )
        .into());
    }

    let result = orchestrator.pay_with(rail.as_ref()).await.map(|_| ());
    Report::of(&orchestrator).emit()?;
    if result.is_err()
        && let Some(pending) = orchestrator.session().outstanding()
    {
        tracing::error!(
            session = %orchestrator.session().id,
            proof = %pending.proof,
            "Recover with `cartsettle recover --retry`"
        );
    }
    result.map_err(Into::into)
}

async fn recover(
    config: &Config,
    commerce: Arc<CommerceClient>,
    args: RecoverArgs,
) -> Result<(), Box<dyn Error>> {
    let store = Arc::new(FileSessionStore::new(&config.checkout.session_dir));
    let session = store
        .load(&args.session)
        .await?
        .ok_or_else(|| format!("no session {} in {}", args.session, store.dir().display()))?;
    let sessions: Arc<dyn SessionStore> = store;
    let mut orchestrator = build_orchestrator(config, commerce, sessions, session);

    let mut result: Result<(), Box<dyn Error>> =
        orchestrator.reopen().await.map(|_| ()).map_err(Into::into);
    if args.retry && result.is_ok() {
        if matches!(orchestrator.state(), CheckoutState::MaterializationFailed { .. }) {
            result = orchestrator
                .retry_materialization()
                .await
                .map(|_| ())
                .map_err(Into::into);
        } else if let Some(pending) = orchestrator.session().unconfirmed() {
            let proof = pending.proof.clone();
            result = recheck_transfer(config, &mut orchestrator, &proof).await;
        }
    }
    Report::of(&orchestrator).emit()?;
    result
}

/// Looks up the receipt of a transfer whose confirmation was never observed
/// and completes or abandons the payment accordingly.
async fn recheck_transfer(
    config: &Config,
    orchestrator: &mut Orchestrator,
    proof: &SettlementProof,
) -> Result<(), Box<dyn Error>> {
    let SettlementProof::Transaction { tx_hash } = proof else {
        return Err(format!("unconfirmed payment {proof} is not a transfer").into());
    };
    match direct_rail(config)?.confirm(*tx_hash).await {
        Ok(proof) => {
            tracing::info!(%tx_hash, "Transfer confirmed");
            orchestrator.confirm_unconfirmed(proof).await?;
            Ok(())
        }
        Err(err @ RailError::Unconfirmed { .. }) => Err(err.into()),
        Err(err) => {
            tracing::warn!(%tx_hash, error = %err, "Transfer failed on-chain; a new payment may start");
            orchestrator.abandon_unconfirmed().await?;
            Err(err.into())
        }
    }
}

fn rpc_url(chain: &ChainConfig) -> Result<Url, url::ParseError> {
    Url::parse(&chain.rpc_url)
}

fn direct_rail(config: &Config) -> Result<DirectTransferRail<impl Provider + use<>>, Box<dyn Error>> {
    let chain = config.chain()?;
    let signer = chain.payer()?;
    let payer: Address = signer.address();
    let provider = ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect_http(rpc_url(chain)?);
    tracing::info!(chain_id = chain.chain_id, %payer, token = %chain.token, "Direct transfer rail ready");
    Ok(DirectTransferRail::new(provider, chain.token(), chain.merchant, payer)
        .with_confirmations(chain.confirmations))
}

fn build_rail(
    kind: RailKind,
    config: &Config,
    commerce: &Arc<CommerceClient>,
) -> Result<Box<dyn PaymentRail>, Box<dyn Error>> {
    match kind {
        RailKind::Direct => Ok(Box::new(direct_rail(config)?)),
        RailKind::Aggregator => {
            let aggregator = config.aggregator()?;
            let api = ApiClient::parse(&aggregator.url)?.with_timeout(config.commerce.timeout());
            let client = AggregatorClient::try_new(api, &aggregator.api_key)?;
            Ok(Box::new(
                AggregatorRail::new(client).with_poll_policy(aggregator.poll_policy()),
            ))
        }
        RailKind::Claim => {
            let claim = config.claim()?;
            let signer = claim.signer()?;
            let domain = claim.domain(config.chain.as_ref())?;
            let mut rail = SignatureClaimRail::new(domain, LocalClaimSigner::new(signer.clone()));
            let distributor = config
                .chain
                .as_ref()
                .and_then(|chain| chain.distributor.map(|d| (chain, d)));
            if let Some((chain, distributor)) = distributor {
                let provider = ProviderBuilder::new()
                    .wallet(EthereumWallet::from(signer))
                    .connect_http(rpc_url(chain)?);
                let permits: Arc<dyn PermitSource> = Arc::<CommerceClient>::clone(commerce);
                let submitter: Arc<dyn RewardSubmitter> =
                    Arc::new(DistributorSubmitter::new(provider, distributor));
                rail = rail.with_rewards(RewardClaimer::new(permits, submitter));
                tracing::info!(%distributor, "Reward claims enabled");
            }
            Ok(Box::new(rail))
        }
    }
}
