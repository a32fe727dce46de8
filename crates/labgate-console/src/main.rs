mod commands;

use std::path::PathBuf;
use std::rc::Rc;

use chrono::DateTime;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;

use labgate_client::{Engine, SyncError};
use labgate_client::access_log::PageOutcome;
use labgate_client::channel::ReverbChannel;
use labgate_client::config::{CONFIG_FILE, ConsoleConfig};
use labgate_client::counts::CountsSource;
use labgate_client::notify::NoticeLog;
use labgate_client::transport::ApiClient;
use labgate_client::unlock::UnlockOutcome;

use commands::{Command, HELP};

fn main() {
    init_tracing();

    let config_path = std::env::args()
        .skip(1)
        .find_map(|a| a.strip_prefix("--config=").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let config = ConsoleConfig::load_from(&config_path);

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            tracing::error!("Invalid configuration: {problem}");
        }
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start runtime");
            std::process::exit(1);
        },
    };
    LocalSet::new().block_on(&runtime, run(config));
}

/// `LABGATE_LOG_FORMAT=json` switches to JSON lines. Logs go to stderr so
/// they do not interleave with console output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LABGATE_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run(config: ConsoleConfig) {
    let http = match ApiClient::new(&config.api) {
        Ok(client) => Rc::new(client),
        Err(e) => {
            tracing::error!(error = %e, "Failed to build HTTP client");
            std::process::exit(1);
        },
    };
    if !http.has_token() {
        tracing::warn!("No API token configured, requests will be unauthenticated");
    }

    let notices = Rc::new(NoticeLog::default());
    let engine = Engine::new(http, config.sync.clone(), Rc::clone(&notices) as _);

    if config.channel.enabled {
        let channel = ReverbChannel::new(config.channel.clone());
        tracing::info!(url = %channel.connect_url(), "Subscribing to event channel");
        let _reconciler = engine.spawn_reconciler(&channel, &config.channel);
    }
    tokio::task::spawn_local(engine.refresher().run());

    tracing::info!(api = %config.api.base_url, "labgate console ready");
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read input");
                break;
            },
        };
        let command = match Command::parse(&line) {
            None => continue,
            Some(Ok(command)) => command,
            Some(Err(e)) => {
                println!("{e}");
                continue;
            },
        };
        if command == Command::Quit {
            break;
        }
        execute(&engine, &notices, command).await;
        print_notices(&notices);
    }

    tracing::info!(stats = ?engine.reconciler.stats(), "labgate console stopped");
    engine.teardown();
}

async fn execute(engine: &Engine<ApiClient>, notices: &Rc<NoticeLog>, command: Command) {
    match command {
        Command::Badge(uid) => {
            // Runs in the background so the next scan is read right away
            let handle = engine.unlock.spawn_badge(uid);
            let notices = Rc::clone(notices);
            tokio::task::spawn_local(async move {
                if let Ok(outcome) = handle.await {
                    print_outcome(&outcome);
                    print_notices(&notices);
                }
            });
        },
        Command::Unlock { machine, badge } => {
            let outcome = engine.unlock.unlock_machine(machine, &badge).await;
            print_outcome(&outcome);
        },
        Command::Machines => {
            let mirror = engine.ctx.mirror();
            for m in mirror.sorted() {
                println!(
                    "{:>4}  {:<8} {:<15} {:<7} {:<8} {}",
                    m.id,
                    m.label(),
                    m.ip_address,
                    if m.is_online { "online" } else { "offline" },
                    if m.is_locked { "locked" } else { "unlocked" },
                    m.status.map_or("-", |s| s.as_str()),
                );
            }
            println!("{} machines", mirror.len());
        },
        Command::Recent(n) => {
            let feed = engine.ctx.activity();
            for scan in feed.recent(n) {
                let at = i64::try_from(scan.observed_at)
                    .ok()
                    .and_then(DateTime::from_timestamp_millis)
                    .map(|t| t.format("%H:%M:%S").to_string())
                    .unwrap_or_default();
                println!(
                    "{at}  {:<24} {:<8} {}",
                    scan.name, scan.machine_label, scan.ip_address
                );
            }
        },
        Command::Counts => {
            let reading = engine.ctx.counts();
            let c = reading.counts;
            let source = match reading.source {
                CountsSource::Derived => "live".to_string(),
                CountsSource::Snapshot { age } => format!("snapshot, {}s old", age.as_secs()),
                CountsSource::Fallback { .. } => "live, snapshot unavailable".to_string(),
            };
            println!(
                "total {}  online {}  offline {}  locked {}  unlocked {}  ({source})",
                c.total, c.online, c.offline, c.locked, c.unlocked
            );
            println!(
                "active {}  inactive {}  maintenance {}",
                c.active, c.inactive, c.maintenance
            );
        },
        Command::Logs(page) => {
            let result = match page {
                Some(n) => engine.access_log.go_to_page(n).await,
                None => engine.access_log.refresh().await,
            };
            report_page(engine, result);
        },
        Command::Search(query) => {
            let result = engine.access_log.set_query(query).await;
            report_page(engine, result);
        },
        Command::Refresh => match engine.refresher().tick().await {
            Ok(report) => println!("{} machines loaded", report.machines.unwrap_or(0)),
            Err(e) => println!("Refresh failed: {}", e.user_message()),
        },
        Command::Logout => {
            engine.teardown();
            engine.http().clear_token();
            println!("Session cleared");
        },
        Command::Help => println!("{HELP}"),
        Command::Quit => {},
    }
}

fn report_page(engine: &Engine<ApiClient>, result: Result<PageOutcome, SyncError>) {
    match result {
        Ok(PageOutcome::Superseded) => {},
        Ok(_) => {
            let view = engine.ctx.access_log();
            for entry in view.entries() {
                let started = entry
                    .started_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "{:>6}  {started:<16}  {:<24} {:<8} {}",
                    entry.id,
                    entry.person,
                    entry.machine_label.as_deref().unwrap_or("-"),
                    entry.status.as_deref().unwrap_or(""),
                );
            }
            let p = view.pagination();
            println!("page {} of {} ({} entries)", p.current_page, p.last_page, p.total);
        },
        // Fetch failures are already announced as notices
        Err(SyncError::Page(e)) => println!("{e}"),
        Err(_) => {},
    }
}

fn print_outcome(outcome: &UnlockOutcome) {
    match outcome {
        UnlockOutcome::Unlocked(report) | UnlockOutcome::Partial { report, .. } => {
            for m in &report.unlocked {
                println!("  unlocked {} ({})", m.label, m.ip_address);
            }
            for failed in &report.failed {
                println!("  not unlocked: {failed}");
            }
        },
        UnlockOutcome::Suppressed => println!("Scan ignored, this badge is already being processed"),
        UnlockOutcome::Failed(_) => {},
    }
}

fn print_notices(notices: &NoticeLog) {
    for notice in notices.drain() {
        println!("[{}] {}", notice.level, notice.message);
    }
}
