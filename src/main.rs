use std::io::{BufRead, Write as _};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use clap::Parser;
use tracing::{error, info, warn};

use slotgrab::backend::{BookingBackend, Credentials, SuccessNotifier, UserPrompt};
use slotgrab::constraints::{parse_weekdays, ConstraintSet, DateWindow, LocationQuery};
use slotgrab::engine::{cancel_pair, Engine, EngineConfig, RunOutcome};
use slotgrab::model::{ConfirmedBooking, GeoPoint, Recipient, ResourceKind, SequenceStage, Slot};
use slotgrab::remote::RemoteBackend;

const DATE_FORMAT: &str = "%d/%m/%Y";

#[derive(Parser, Debug)]
#[command(name = "slotgrab", about = "Book the first qualifying appointment slot", version)]
struct Cli {
    /// City or area to search. Repeatable.
    #[arg(required = true)]
    locations: Vec<String>,

    /// Account username (email).
    #[arg(long)]
    username: String,

    /// Account password. Prompted for when omitted.
    #[arg(long)]
    password: Option<String>,

    /// Base URL of the booking service.
    #[arg(long, default_value = "https://booking.example.com")]
    base_url: String,

    /// Acceptable resource kind. Repeatable; all kinds when omitted.
    #[arg(long = "kind")]
    kinds: Vec<String>,

    /// Sequence stage to hunt for (first/second/third or 1/2/3).
    /// Defaults to whatever the recipient's history says is due.
    #[arg(long)]
    stage: Option<String>,

    /// First acceptable date, DD/MM/YYYY. Defaults to today.
    #[arg(long)]
    start_date: Option<String>,

    /// Last acceptable date, DD/MM/YYYY. Overrides --time-window.
    #[arg(long)]
    end_date: Option<String>,

    /// Number of days to search from the start date.
    #[arg(long, default_value_t = 7)]
    time_window: u32,

    /// Weekday to skip (e.g. "sat"). Repeatable.
    #[arg(long = "exclude-weekday")]
    exclude_weekdays: Vec<String>,

    /// Only book at a site with exactly this name. Repeatable.
    #[arg(long = "site")]
    sites: Vec<String>,

    /// Only book at sites whose name matches this regex.
    #[arg(long)]
    site_regex: Option<String>,

    /// Never book at a site with exactly this name. Repeatable.
    #[arg(long = "exclude-site")]
    exclude_sites: Vec<String>,

    /// Never book at sites whose name matches this regex.
    #[arg(long)]
    exclude_site_regex: Option<String>,

    /// Only book at sites with this postal code.
    #[arg(long)]
    postal: Option<String>,

    /// Also search areas neighboring the given locations.
    #[arg(long)]
    include_neighbors: bool,

    /// Starting point "lat,lon"; sites nearer to it are tried first.
    #[arg(long)]
    origin: Option<String>,

    /// Index of the recipient to book for when the account holds
    /// several. Prompted for interactively when omitted.
    #[arg(long)]
    patient: Option<usize>,

    /// Scan and select but never submit a real booking.
    #[arg(long)]
    dry_run: bool,

    /// Ask before submitting each booking.
    #[arg(long)]
    confirm: bool,

    /// Seconds to sleep between two passes over the site list.
    #[arg(long, default_value_t = 5)]
    interval: u64,

    /// Give up after this many consecutive passes in which no site was
    /// reachable. Polls forever when omitted.
    #[arg(long)]
    give_up_after: Option<u32>,
}

/// Reads second-factor codes and confirmations from the terminal.
struct StdinPrompt;

#[async_trait]
impl UserPrompt for StdinPrompt {
    async fn request_second_factor(&self) -> Option<String> {
        read_line("Enter the verification code you received: ")
            .await
            .filter(|code| !code.is_empty())
    }

    async fn request_confirmation(&self, slot: &Slot) -> bool {
        let question = format!("Book {} at {}? [y/N] ", slot.kind, slot.start);
        matches!(
            read_line(&question).await.as_deref(),
            Some("y") | Some("Y") | Some("yes")
        )
    }
}

async fn read_line(question: &str) -> Option<String> {
    let question = question.to_string();
    tokio::task::spawn_blocking(move || {
        print!("{question}");
        std::io::stdout().flush().ok()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).ok()?;
        Some(line.trim().to_string())
    })
    .await
    .ok()
    .flatten()
}

/// Rings the terminal bell so an unattended user notices the success.
struct BellNotifier;

impl SuccessNotifier for BellNotifier {
    fn notify_success(&self, booking: &ConfirmedBooking, recipient: &Recipient) {
        print!("\x07");
        let _ = std::io::stdout().flush();
        info!(
            recipient = %recipient.display_name,
            start = %booking.slot.start,
            code = booking.confirmation_code.as_deref().unwrap_or("-"),
            "appointment booked"
        );
    }
}

fn parse_cli_date(raw: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .with_context(|| format!("invalid date '{raw}', expected DD/MM/YYYY"))
}

fn parse_origin(raw: &str) -> anyhow::Result<GeoPoint> {
    let (lat, lon) = raw
        .split_once(',')
        .context("invalid origin, expected 'lat,lon'")?;
    Ok(GeoPoint {
        latitude: lat.trim().parse().context("invalid origin latitude")?,
        longitude: lon.trim().parse().context("invalid origin longitude")?,
    })
}

fn build_constraints(cli: &Cli) -> anyhow::Result<ConstraintSet> {
    let start = match &cli.start_date {
        Some(raw) => parse_cli_date(raw)?,
        None => Utc::now().date_naive(),
    };
    let end = match &cli.end_date {
        Some(raw) => parse_cli_date(raw)?,
        None => start + ChronoDuration::days(i64::from(cli.time_window)),
    };
    let window = DateWindow::new(start, end)?;

    let locations: Vec<LocationQuery> = cli
        .locations
        .iter()
        .map(|name| LocationQuery::new(name).with_neighbors(cli.include_neighbors))
        .collect();

    let mut constraints = ConstraintSet::new(locations, window)?;
    constraints.resource_filter = cli.kinds.iter().map(ResourceKind::new).collect();
    constraints.sequence_stage = cli
        .stage
        .as_deref()
        .map(|s| s.parse::<SequenceStage>().map_err(anyhow::Error::msg))
        .transpose()?;
    constraints.weekday_exclusions = parse_weekdays(&cli.exclude_weekdays)?;
    constraints.site_include = cli.sites.clone();
    constraints.site_exclude = cli.exclude_sites.clone();
    constraints.site_include_regex = cli
        .site_regex
        .as_deref()
        .map(regex::Regex::new)
        .transpose()
        .context("invalid --site-regex")?;
    constraints.site_exclude_regex = cli
        .exclude_site_regex
        .as_deref()
        .map(regex::Regex::new)
        .transpose()
        .context("invalid --exclude-site-regex")?;
    constraints.postal_filter = cli.postal.clone();
    constraints.origin = cli.origin.as_deref().map(parse_origin).transpose()?;
    constraints.dry_run = cli.dry_run;
    constraints.require_confirmation = cli.confirm;
    Ok(constraints)
}

async fn pick_recipient(
    recipients: Vec<Recipient>,
    wanted: Option<usize>,
) -> anyhow::Result<Recipient> {
    if recipients.is_empty() {
        bail!("the account holds no recipient to book for");
    }
    if let Some(index) = wanted {
        return recipients
            .into_iter()
            .nth(index)
            .with_context(|| format!("no recipient at index {index}"));
    }
    if recipients.len() == 1 {
        return recipients
            .into_iter()
            .next()
            .context("the account holds no recipient to book for");
    }

    for (i, r) in recipients.iter().enumerate() {
        println!("  [{i}] {}", r.display_name);
    }
    let answer = read_line("Who is this booking for? ")
        .await
        .context("no recipient selected")?;
    let index: usize = answer.parse().context("expected a recipient index")?;
    recipients
        .into_iter()
        .nth(index)
        .with_context(|| format!("no recipient at index {index}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    slotgrab::logging::init();
    let cli = Cli::parse();

    let constraints = build_constraints(&cli)?;

    let password = match cli.password.clone() {
        Some(p) => p,
        None => read_line("Password: ").await.context("no password given")?,
    };
    let credentials = Credentials {
        username: cli.username.clone(),
        password,
    };

    let prompt = Arc::new(StdinPrompt);
    let backend =
        RemoteBackend::new(&cli.base_url, prompt.clone()).context("building the HTTP client")?;

    let session = backend.authenticate(&credentials).await?;
    info!(username = %cli.username, "authenticated");

    let recipients = backend
        .list_recipients(&session)
        .await
        .context("listing recipients")?;
    let recipient = pick_recipient(recipients, cli.patient).await?;
    info!(recipient = %recipient.display_name, "booking for");

    let config = EngineConfig {
        pass_interval: Duration::from_secs(cli.interval),
        give_up_after_passes: cli.give_up_after,
        ..EngineConfig::default()
    };

    let (handle, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current step");
            handle.cancel();
        }
    });

    let notifier = BellNotifier;
    let engine = Engine::new(&backend, prompt.as_ref(), &notifier).with_config(config);

    match engine.run(&constraints, &recipient, session, token).await {
        RunOutcome::Booked { booking, recipient } => {
            println!(
                "Booked: {} on {} for {}",
                booking.slot.kind, booking.slot.start, recipient.display_name
            );
            if let Some(code) = &booking.confirmation_code {
                println!("Confirmation code: {code}");
            }
            for follow_up in &booking.slot.follow_ups {
                println!("Linked follow-up slot: {follow_up}");
            }
            Ok(())
        }
        RunOutcome::Cancelled => {
            info!("run cancelled");
            Ok(())
        }
        RunOutcome::Failed(err) => {
            error!(error = %err, "run failed");
            Err(err.into())
        }
    }
}
