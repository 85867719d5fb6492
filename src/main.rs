use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;

use loaner::availability::AvailabilityEngine;
use loaner::booking::{BookingForm, BookingWorkflow, DATE_FORMAT};
use loaner::calendar::{Calendar, Month};
use loaner::compactor;
use loaner::config::Config;
use loaner::mail::{LogTransport, MailQueue};
use loaner::model::*;
use loaner::session::SessionStore;
use loaner::store::{IntervalStore, LocalStore, PgStore, Timed};

#[derive(Parser)]
#[command(name = "loaner", about = "Laptop loan reservations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the catalog.
    Items,
    /// Add a laptop to the catalog.
    AddItem { name: String },
    /// Find laptops free for a whole date range.
    Search {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        /// Only check this laptop.
        #[arg(long)]
        item: Option<ItemId>,
    },
    /// Book a laptop for a guest.
    Book {
        #[arg(long)]
        item: ItemId,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "")]
        phone: String,
    },
    /// List reservations.
    Reservations {
        /// Only those not yet processed.
        #[arg(long)]
        new: bool,
    },
    /// Mark a reservation processed.
    Process { id: ReservationId },
    /// Delete a reservation and its restriction.
    Delete { id: ReservationId },
    /// Show one month of reservations and owner blocks.
    Calendar {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        month: u32,
    },
    /// Block a laptop for one day.
    Block {
        #[arg(long)]
        item: ItemId,
        #[arg(long)]
        date: NaiveDate,
    },
    /// Remove an owner block by restriction id.
    Unblock { id: RestrictionId },
    /// Rewrite the local journal now.
    Compact,
    /// Keep compacting the local journal until interrupted.
    Maintain,
}

enum Backend {
    Local(Arc<LocalStore>),
    Pg(Arc<PgStore>),
}

impl Backend {
    async fn open(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        match &config.database_url {
            Some(url) => {
                let pg = PgStore::connect(url, config.db_max_connections, config.store_timeout).await?;
                pg.migrate().await?;
                Ok(Self::Pg(Arc::new(pg)))
            }
            None => {
                std::fs::create_dir_all(&config.data_dir)?;
                let local = LocalStore::open(&config.journal_path())?;
                Ok(Self::Local(Arc::new(local)))
            }
        }
    }

    fn store(&self, timeout: Duration) -> Arc<dyn IntervalStore> {
        match self {
            Self::Local(local) => Arc::new(Timed::new(local.clone(), timeout)),
            Self::Pg(pg) => Arc::new(Timed::new(pg.clone(), timeout)),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Pg(_) => "postgres",
        }
    }
}

fn print_items(items: &[Item]) {
    for item in items {
        println!("{:>6}  {}", item.id, item.name);
    }
}

fn day_cell(calendar: &loaner::calendar::ItemCalendar, day: NaiveDate) -> char {
    if calendar.reservations.get(&day).is_some_and(|id| *id > 0) {
        'R'
    } else if calendar.blocks.get(&day).is_some_and(|id| *id > 0) {
        'B'
    } else {
        '.'
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    loaner::observability::init(config.metrics_port)?;

    let backend = Backend::open(&config).await?;
    let store = backend.store(config.store_timeout);
    info!(
        backend = backend.name(),
        data_dir = %config.data_dir.display(),
        metrics = %config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")),
        "loaner ready"
    );

    let (mail, mail_rx) = MailQueue::new(config.mail_queue_capacity);
    let mail_task = tokio::spawn(loaner::mail::run_mail_listener(mail_rx, LogTransport));
    let availability = AvailabilityEngine::new(store.clone());

    match cli.command {
        Command::Items => print_items(&store.items().await?),
        Command::AddItem { name } => {
            let item = match &backend {
                Backend::Local(local) => local.add_item(&name).await?,
                Backend::Pg(pg) => pg.add_item(&name).await?,
            };
            println!("added item {} ({})", item.id, item.name);
        }
        Command::Search { start, end, item } => match item {
            Some(id) => {
                let free = availability.is_item_available(id, start, end).await?;
                println!("item {id} {}", if free { "is available" } else { "is not available" });
            }
            None => print_items(&availability.available_items(start, end).await?),
        },
        Command::Book {
            item,
            start,
            end,
            first_name,
            last_name,
            email,
            phone,
        } => {
            let workflow = BookingWorkflow::new(
                availability.clone(),
                mail.clone(),
                config.mail_from.clone(),
                config.admin_email.clone(),
            );
            let form = BookingForm {
                item_id: item.to_string(),
                first_name,
                last_name,
                email,
                phone,
                start_date: start,
                end_date: end,
            };
            let confirmation = workflow.book(&form).await?;
            println!(
                "reservation {} confirmed: {} for {} {}, {} to {}",
                confirmation.booking.reservation_id,
                confirmation.item.name,
                confirmation.guest.first_name,
                confirmation.guest.last_name,
                confirmation.span.start.format(DATE_FORMAT),
                confirmation.span.end.format(DATE_FORMAT),
            );
        }
        Command::Reservations { new } => {
            let filter = if new { ReservationFilter::Unprocessed } else { ReservationFilter::All };
            for r in store.reservations(filter).await? {
                println!(
                    "{:>6}  item {:<4} {}  {} {} <{}>{}",
                    r.id,
                    r.item_id,
                    r.span,
                    r.guest.first_name,
                    r.guest.last_name,
                    r.guest.email,
                    if r.processed { "  processed" } else { "" },
                );
            }
        }
        Command::Process { id } => {
            store.update_reservation_processed(id, true).await?;
            println!("reservation {id} marked as processed");
        }
        Command::Delete { id } => {
            store.delete_reservation(id).await?;
            println!("reservation {id} deleted");
        }
        Command::Calendar { year, month } => {
            let sessions = Arc::new(SessionStore::new(config.session_lifetime));
            let calendar = Calendar::new(store.clone(), sessions.clone());
            let view = calendar.render_month(sessions.create(), Month::new(year, month)?).await?;
            println!("{view_month}  (R reserved, B blocked)", view_month = view.month);
            for row in &view.items {
                let days: String = view
                    .month
                    .span()
                    .days()
                    .map(|day| day_cell(row, day))
                    .collect();
                println!("{:>6}  {:<24} {days}", row.item.id, row.item.name);
            }
        }
        Command::Block { item, date } => {
            let id = store.insert_restriction(NewRestriction::block(item, date)).await?;
            println!("block {id} added on item {item} for {}", date.format(DATE_FORMAT));
        }
        Command::Unblock { id } => {
            store.delete_restriction(id).await?;
            println!("block {id} removed");
        }
        Command::Compact => match &backend {
            Backend::Local(local) => {
                local.compact().await?;
                println!("journal compacted");
            }
            Backend::Pg(_) => println!("nothing to compact on the postgres backend"),
        },
        Command::Maintain => match &backend {
            Backend::Local(local) => {
                info!(threshold = config.compact_threshold, "compactor running, ctrl-c to stop");
                tokio::select! {
                    _ = compactor::run_compactor(local.clone(), config.compact_threshold, Duration::from_secs(30)) => {}
                    _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
                }
            }
            Backend::Pg(_) => println!("nothing to maintain on the postgres backend"),
        },
    }

    if let Backend::Local(local) = &backend {
        compactor::compact_if_due(local, config.compact_threshold).await;
    }

    // Let queued confirmation mail drain before exiting.
    drop(availability);
    drop(mail);
    drop(store);
    if let Err(e) = mail_task.await {
        tracing::error!("mail listener failed: {e}");
    }
    info!("loaner stopped");
    Ok(())
}
