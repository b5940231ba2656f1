use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use ecofinds::config::Config;
use ecofinds::market::{
  AddToCart, ApiClient, Market, ProductFilters, ProductInput, UpdateProduct,
};
use ecofinds::{
  ClientOptions, MutationDescriptor, Notification, NotificationSink, QueryClient, QueryError,
  Severity,
};

#[derive(Parser, Debug)]
#[command(name = "ecofinds")]
#[command(about = "Command-line client for the EcoFinds marketplace")]
#[command(version)]
struct Cli {
  /// Path to config file (default: $XDG_CONFIG_HOME/ecofinds/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Browse the catalog
  Products {
    #[arg(long)]
    q: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    page: Option<u32>,
  },
  /// Show one listing
  Product { id: String },
  /// Your own listings
  MyProducts,
  CreateProduct(ProductArgs),
  UpdateProduct {
    id: String,
    #[command(flatten)]
    product: ProductArgs,
  },
  DeleteProduct { id: String },
  Cart,
  CartAdd {
    product_id: String,
    #[arg(long, default_value_t = 1)]
    quantity: u32,
  },
  /// Remove a cart line by its item id
  CartRemove { item_id: String },
  CartClear,
  Checkout,
  /// Previous purchases
  Orders,
  Order { id: String },
}

#[derive(Args, Debug)]
struct ProductArgs {
  #[arg(long)]
  title: String,
  #[arg(long)]
  description: String,
  #[arg(long)]
  price: f64,
  #[arg(long)]
  category: String,
  #[arg(long)]
  image: Option<String>,
}

impl From<ProductArgs> for ProductInput {
  fn from(a: ProductArgs) -> Self {
    ProductInput {
      title: a.title,
      description: a.description,
      price: a.price,
      category: a.category,
      image: a.image,
    }
  }
}

/// Prints toasts to stderr so stdout stays machine-readable.
struct StderrSink;

impl NotificationSink for StderrSink {
  fn notify(&self, n: Notification) {
    let marker = match n.severity {
      Severity::Error => "✗",
      Severity::Success => "✓",
      Severity::Info => "•",
    };
    eprintln!("{} {}: {}", marker, n.title, n.description);
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Cli::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = ecofinds::telemetry::init(&config.logging)?;

  let client = QueryClient::new(
    ClientOptions {
      gc_time: config.cache.gc_time(),
      default_stale_time: config.cache.stale_time(),
    },
    Arc::new(StderrSink),
  );
  let api = ApiClient::new(&config)?;
  let market = Market::new(client, Arc::new(api))
    .with_products_stale_time(config.cache.products_stale_time());

  run(&market, args.command).await
}

async fn run(market: &Market, command: Command) -> Result<()> {
  match command {
    Command::Products { q, category, page } => {
      let filters = ProductFilters { q, category, page };
      print(&read(market.products(&filters).await)?)
    }
    Command::Product { id } => print(&read(market.product(&id).await)?),
    Command::MyProducts => print(&read(market.my_products().await)?),
    Command::Cart => print(&read(market.cart().await)?),
    Command::Orders => print(&read(market.orders().await)?),
    Command::Order { id } => print(&read(market.order(&id).await)?),

    Command::CreateProduct(product) => write(market, market.create_product(), product.into()).await,
    Command::UpdateProduct { id, product } => {
      let update = UpdateProduct {
        product_id: id,
        product: product.into(),
      };
      write(market, market.update_product(), update).await
    }
    Command::DeleteProduct { id } => write(market, market.delete_product(), id).await,
    Command::CartAdd {
      product_id,
      quantity,
    } => {
      let item = AddToCart::new(product_id).quantity(quantity);
      write(market, market.add_to_cart(), item).await
    }
    Command::CartRemove { item_id } => write(market, market.remove_from_cart(), item_id).await,
    Command::CartClear => write(market, market.clear_cart(), ()).await,
    Command::Checkout => write(market, market.checkout(), ()).await,
  }
}

fn read<T>(result: std::result::Result<T, QueryError>) -> Result<T> {
  result.map_err(|e| eyre!("{}", e))
}

/// Run a mutation; the sink has already reported the outcome to the user.
async fn write<I>(market: &Market, descriptor: MutationDescriptor<I>, input: I) -> Result<()>
where
  I: Clone + Send + 'static,
{
  let handle = market.client().use_mutation(descriptor);
  match handle.run(input).await {
    Ok(response) if response.is_null() => Ok(()),
    Ok(response) => print(&response),
    Err(e) => Err(eyre!("{} failed: {}", handle.name(), e)),
  }
}

fn print<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
