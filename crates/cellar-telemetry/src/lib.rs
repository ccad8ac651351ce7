//! Opt-in, file-local usage events and crash reports.
//!
//! Events are appended as JSONL under the cellar data directory; nothing is
//! ever sent over the network. Both channels are off unless the
//! `CELLAR_TELEMETRY` / `CELLAR_TELEMETRY_CRASH` env flags enable them.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, OnceLock};

use serde::Serialize;

const EVENT_QUEUE_CAPACITY: usize = 128;
const MAX_EVENT_BYTES: u64 = 1024 * 1024;

pub struct Telemetry {
    app_name: String,
    app_version: String,
    session_id: String,
    usage_enabled: AtomicBool,
    crash_enabled: AtomicBool,
    sender: SyncSender<UsageEvent>,
}

#[derive(Serialize)]
struct UsageEvent {
    event: String,
    at_unix_millis: i64,
    app: String,
    version: String,
    session_id: String,
    properties: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct CrashReport {
    at_unix_millis: i64,
    app: String,
    version: String,
    session_id: String,
    message: String,
    location: Option<String>,
}

static TELEMETRY: OnceLock<Arc<Telemetry>> = OnceLock::new();

pub fn init(app_name: &'static str, app_version: &'static str) -> Arc<Telemetry> {
    if let Some(existing) = TELEMETRY.get() {
        return Arc::clone(existing);
    }

    let (sender, receiver) = sync_channel(EVENT_QUEUE_CAPACITY);
    let telemetry = Arc::new(Telemetry {
        app_name: app_name.to_string(),
        app_version: app_version.to_string(),
        session_id: new_session_id(),
        usage_enabled: AtomicBool::new(env_flag("CELLAR_TELEMETRY")),
        crash_enabled: AtomicBool::new(env_flag("CELLAR_TELEMETRY_CRASH")),
        sender,
    });

    start_writer_thread(Arc::clone(&telemetry), receiver);
    install_panic_hook(Arc::clone(&telemetry));

    let _ = TELEMETRY.set(Arc::clone(&telemetry));
    telemetry
}

pub fn event(event: &str, properties: &[(&str, &str)]) {
    if let Some(telemetry) = TELEMETRY.get() {
        telemetry.event(event, properties);
    }
}

impl Telemetry {
    fn event(&self, event: &str, properties: &[(&str, &str)]) {
        if !self.usage_enabled.load(Ordering::Relaxed) {
            return;
        }
        let mut map = BTreeMap::new();
        for (key, value) in properties {
            if !key.trim().is_empty() {
                map.insert((*key).to_string(), (*value).to_string());
            }
        }
        let event = UsageEvent {
            event: event.to_string(),
            at_unix_millis: cellar_util::now_millis(),
            app: self.app_name.clone(),
            version: self.app_version.clone(),
            session_id: self.session_id.clone(),
            properties: map,
        };
        let _ = self.sender.try_send(event);
    }

    fn crash_report(&self, message: String, location: Option<String>) {
        if !self.crash_enabled.load(Ordering::Relaxed) {
            return;
        }
        let report = CrashReport {
            at_unix_millis: cellar_util::now_millis(),
            app: self.app_name.clone(),
            version: self.app_version.clone(),
            session_id: self.session_id.clone(),
            message,
            location,
        };
        write_crash_report(&self.app_name, &report);
    }
}

fn start_writer_thread(telemetry: Arc<Telemetry>, receiver: Receiver<UsageEvent>) {
    std::thread::spawn(move || {
        while let Ok(event) = receiver.recv() {
            write_event(&telemetry.app_name, &event);
        }
    });
}

fn install_panic_hook(telemetry: Arc<Telemetry>) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = if let Some(msg) = info.payload().downcast_ref::<&str>() {
            (*msg).to_string()
        } else if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.clone()
        } else {
            "panic".to_string()
        };
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()));
        telemetry.crash_report(message, location);
        default_hook(info);
    }));
}

fn telemetry_dir(app_name: &str) -> PathBuf {
    cellar_util::data_dir().join("telemetry").join(app_name)
}

fn write_event(app_name: &str, event: &UsageEvent) {
    let dir = telemetry_dir(app_name);
    if fs::create_dir_all(&dir).is_err() {
        return;
    }

    let path = dir.join("events.jsonl");
    if rotate_if_needed(&path).is_err() {
        return;
    }

    let mut file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => file,
        Err(_) => return,
    };
    if let Ok(line) = serde_json::to_string(event) {
        let _ = writeln!(file, "{line}");
    }
}

fn rotate_if_needed(path: &Path) -> std::io::Result<()> {
    if let Ok(meta) = fs::metadata(path) {
        if meta.len() >= MAX_EVENT_BYTES {
            let rotated = path.with_extension("jsonl.1");
            let _ = fs::remove_file(&rotated);
            fs::rename(path, rotated)?;
        }
    }
    Ok(())
}

fn write_crash_report(app_name: &str, report: &CrashReport) {
    let dir = telemetry_dir(app_name).join("crashes");
    if fs::create_dir_all(&dir).is_err() {
        return;
    }
    let filename = format!("crash-{}-{}.json", report.at_unix_millis, std::process::id());
    if let Ok(file) = OpenOptions::new()
        .create(true)
        .write(true)
        .open(dir.join(filename))
    {
        let _ = serde_json::to_writer_pretty(file, report);
    }
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn new_session_id() -> String {
    format!("{:x}-{:x}", cellar_util::now_millis(), std::process::id())
}
