//! Command implementations for the demo binary.

use color_eyre::{eyre::eyre, Result};
use qcache::cache::{QueryObserver, QueryState, Subscription};
use qcache::market::{InMemoryBackend, MarketClient, NewProduct, Product, ProductStatus, ProductUpdate};
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

use crate::Command;

/// Default viewer for the scenario when none is configured.
const SCENARIO_USER: &str = "demo-user";

pub async fn run(command: Command, client: &MarketClient, backend: &InMemoryBackend) -> Result<()> {
  match command {
    Command::List { json } => list(client, json).await,
    Command::Like { id } => like(client, &id).await,
    Command::Edit {
      id,
      title,
      price,
      sold,
    } => {
      let update = ProductUpdate {
        title,
        price,
        status: sold.then_some(ProductStatus::Sold),
      };
      edit(client, &id, update).await
    }
    Command::Create {
      title,
      price,
      category,
      condition,
      location,
    } => {
      let new = NewProduct {
        title,
        price,
        condition,
        location,
        category,
      };
      create(client, new).await
    }
    Command::Delete { id } => delete(client, &id).await,
    Command::Categories => categories(client).await,
    Command::Scenario => scenario(client, backend).await,
  }
}

async fn list(client: &MarketClient, json: bool) -> Result<()> {
  let products = client.products().await?;
  if json {
    println!("{}", serde_json::to_string_pretty(&products)?);
    return Ok(());
  }
  for product in &products {
    println!("{}", format_product(product));
  }
  Ok(())
}

async fn like(client: &MarketClient, id: &str) -> Result<()> {
  client.products().await?;
  let _watch = print_changes(client, id);

  match client.toggle_like(id).await {
    Ok(liked) => println!("{} {}", if liked { "liked" } else { "unliked" }, id),
    Err(err) => println!("like failed, rolled back: {err}"),
  }
  client.listings().wait_idle(&client.listings_key()).await;
  Ok(())
}

async fn edit(client: &MarketClient, id: &str, update: ProductUpdate) -> Result<()> {
  if update.is_empty() {
    return Err(eyre!("Nothing to edit: pass --title, --price or --sold"));
  }
  client.products().await?;
  let before = client.product(id).await?;
  println!("before: {}", format_product(&before));

  let after = client.update_product(id, update).await?;
  println!("after:  {}", format_product(&after));

  if let Some(entry) = client.listings().get(&client.listings_key()) {
    println!("listing is now {:?}", entry.state);
  }
  Ok(())
}

async fn create(client: &MarketClient, new: NewProduct) -> Result<()> {
  let product = client.create_product(new).await?;
  println!("created: {}", format_product(&product));
  client.listings().wait_idle(&client.listings_key()).await;
  println!("listing now has {} products", client.products().await?.len());
  Ok(())
}

async fn delete(client: &MarketClient, id: &str) -> Result<()> {
  client.products().await?;
  match client.delete_product(id).await {
    Ok(()) => println!("deleted {id}"),
    Err(err) => println!("delete failed, rolled back: {err}"),
  }
  client.listings().wait_idle(&client.listings_key()).await;
  println!("listing now has {} products", client.products().await?.len());
  Ok(())
}

async fn categories(client: &MarketClient) -> Result<()> {
  for category in client.categories().await? {
    println!("{:<10} {}", category.id, category.name);
  }
  Ok(())
}

async fn scenario(client: &MarketClient, backend: &InMemoryBackend) -> Result<()> {
  let client = match client.viewer() {
    Some(_) => client.clone(),
    None => client.for_viewer(Some(SCENARIO_USER.to_string())),
  };
  let key = client.listings_key();
  let mut observer = QueryObserver::new(client.listings().clone(), key.clone());

  println!("== Load listings as {}", client.viewer().unwrap_or(SCENARIO_USER));
  observer.fetch();
  render_until(&mut observer, "P1", client.products()).await?;

  println!("== Like P1 while the backend rejects the write");
  backend.fail_next_writes(1);
  if let Err(err) = render_until(&mut observer, "P1", client.toggle_like("P1")).await {
    println!("  remote call failed: {err}");
  }
  render_until(&mut observer, "P1", settle(&client)).await;

  println!("== Like P1 again");
  render_until(&mut observer, "P1", client.toggle_like("P1")).await?;
  render_until(&mut observer, "P1", settle(&client)).await;

  println!("== Two quick taps on P3 run in order");
  let (first, second) = render_until(&mut observer, "P3", async {
    tokio::join!(client.toggle_like("P3"), client.toggle_like("P3"))
  })
  .await;
  println!("  taps settled: liked={} then liked={}", first?, second?);
  render_until(&mut observer, "P3", settle(&client)).await;

  println!("== Seller marks P2 sold");
  let update = ProductUpdate {
    status: Some(ProductStatus::Sold),
    ..Default::default()
  };
  render_until(&mut observer, "P2", client.update_product("P2", update)).await?;
  render_until(&mut observer, "P2", settle(&client)).await;

  println!("== Backend writes");
  for write in backend.writes() {
    println!("  {write}");
  }
  Ok(())
}

async fn settle(client: &MarketClient) {
  client.listings().wait_idle(&client.listings_key()).await;
}

/// Drive `work` while printing every observed change to product `id`, the
/// way a render loop would.
async fn render_until<F: Future>(observer: &mut QueryObserver<Vec<Product>>, id: &str, work: F) -> F::Output {
  tokio::pin!(work);
  let mut ticker = interval(Duration::from_millis(10));
  ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

  loop {
    tokio::select! {
      output = &mut work => {
        if observer.poll() {
          render(observer, id);
        }
        return output;
      }
      _ = ticker.tick() => {
        if observer.poll() {
          render(observer, id);
        }
      }
    }
  }
}

fn render(observer: &QueryObserver<Vec<Product>>, id: &str) {
  match observer.state() {
    QueryState::Idle => {}
    QueryState::Loading => println!("  loading"),
    QueryState::Error(error) => println!("  error: {error}"),
    QueryState::Ready(entry) => {
      if let Some(product) = entry.data.iter().find(|product| product.id == id) {
        println!("  {:<9} {}", format!("{:?}", entry.state), format_product(product));
      }
    }
  }
}

/// Print every write to product `id` in the viewer's listing.
fn print_changes(client: &MarketClient, id: &str) -> Subscription<Vec<Product>> {
  let id = id.to_string();
  client.listings().subscribe(&client.listings_key(), move |entry| {
    if let Some(product) = entry.data.iter().find(|product| product.id == id) {
      println!("  {:<9} {}", format!("{:?}", entry.state), format_product(product));
    }
  })
}

fn format_product(product: &Product) -> String {
  format!(
    "{:<4} {:<20} {:>8.2}  {:>3} {}  {}",
    product.id,
    product.title,
    product.price,
    product.likes_count,
    if product.is_liked { "♥" } else { "♡" },
    product.status,
  )
}
