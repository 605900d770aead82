//! HTTP status page and filter switching.
//!
//! `GET /` renders a snapshot of every cached handler (progress, gapless
//! arrows, output peak) plus a bounded list of recently retired ones.
//! `GET /settings?f=<index>&d=<0|1>` switches the active filter
//! subdirectory and the debug-log level, then redirects back to `/`.

use folve_engine::{
    current_time, CacheObserver, FileHandler, FolveFilesystem, HandlerStats, HandlerStatus,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tiny_http::{Header, Response, Server};

const MAX_RETIRED: usize = 20;
const PROGRESS_WIDTH_PX: u32 = 300;
const SETTINGS_URL: &str = "/settings";

/// Toggle callback for runtime debug logging.
pub type DebugToggle = Box<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Totals {
    seconds_seen: f64,
    seconds_filtered: f64,
}

struct Inner {
    fs: Arc<FolveFilesystem>,
    retired: Mutex<VecDeque<HandlerStats>>,
    expunged_retired: AtomicUsize,
    totals: Mutex<Totals>,
    meta_refresh_seconds: i64,
    filter_switched: AtomicBool,
    debug_toggle: DebugToggle,
}

impl Inner {
    fn account(&self, stats: &HandlerStats) {
        if stats.duration_seconds >= 0 && stats.buffer_progress >= 0.0 {
            let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
            totals.seconds_seen += stats.duration_seconds as f64;
            totals.seconds_filtered +=
                stats.duration_seconds as f64 * f64::from(stats.buffer_progress);
        }
    }
}

impl CacheObserver for Inner {
    fn insert_handler_event(&self, _handler: &Arc<dyn FileHandler>) {}

    fn retire_handler_event(&self, handler: &Arc<dyn FileHandler>) {
        let mut stats = handler.handler_stats();
        self.account(&stats);
        stats.status = HandlerStatus::Retired;
        stats.last_access = current_time();
        let mut retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());
        retired.push_front(stats);
        while retired.len() > MAX_RETIRED {
            retired.pop_back();
            self.expunged_retired.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// The status server; serves until the process exits.
pub struct StatusServer {
    inner: Arc<Inner>,
}

impl StatusServer {
    /// Start serving on `port` and register as the cache's observer.
    /// `meta_refresh_seconds < 0` disables the page auto-refresh.
    pub fn start(
        fs: Arc<FolveFilesystem>,
        port: u16,
        meta_refresh_seconds: i64,
        debug_toggle: DebugToggle,
    ) -> anyhow::Result<Self> {
        let server = Server::http(("0.0.0.0", port))
            .map_err(|e| anyhow::anyhow!("status server on port {port}: {e}"))?;
        let inner = Arc::new(Inner {
            fs: Arc::clone(&fs),
            retired: Mutex::new(VecDeque::new()),
            expunged_retired: AtomicUsize::new(0),
            totals: Mutex::new(Totals::default()),
            meta_refresh_seconds,
            filter_switched: AtomicBool::new(false),
            debug_toggle,
        });
        let observer: Arc<dyn CacheObserver> = inner.clone();
        fs.handler_cache().set_observer(observer);

        let worker = Arc::clone(&inner);
        std::thread::Builder::new()
            .name("folve-status".to_string())
            .spawn(move || serve(&server, &worker))?;
        tracing::info!(port, "HTTP status server running");
        Ok(Self { inner })
    }

    /// Render the page once (mainly for tests).
    pub fn page(&self) -> String {
        create_page(&self.inner)
    }
}

fn serve(server: &Server, inner: &Arc<Inner>) {
    for request in server.incoming_requests() {
        let url = request.url().to_string();
        let (path, query) = match url.split_once('?') {
            Some((p, q)) => (p, q),
            None => (url.as_str(), ""),
        };

        let response = if path == SETTINGS_URL {
            apply_settings(inner, query);
            // Redirect to / so a reload does not re-apply the switch.
            Response::from_string(String::new())
                .with_status_code(302)
                .with_header(header("Location", "/"))
        } else {
            Response::from_string(create_page(inner))
                .with_header(header("Content-Type", "text/html; charset=utf-8"))
        };
        let response = response.with_header(header("Cache-Control", "no-cache"));
        if let Err(e) = request.respond(response) {
            tracing::debug!(error = %e, "status response failed");
        }
    }
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("static header")
}

/// Key=value pairs of a query string.
fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn apply_settings(inner: &Inner, query: &str) {
    if let Some(index) = query_param(query, "f").and_then(|v| v.parse::<usize>().ok()) {
        if inner.fs.switch_current_config_index(index) {
            inner.filter_switched.store(true, Ordering::Relaxed);
        }
    }
    if let Some(value) = query_param(query, "d") {
        if inner.fs.debug_ui_enabled() {
            (inner.debug_toggle)(value == "1");
        }
    }
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// `Dd H:MM:SS` for the totals line.
fn format_duration(total_seconds: i64) -> String {
    let days = total_seconds / 86400;
    let hours = (total_seconds % 86400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{days}d {hours}:{minutes:02}:{seconds:02}")
}

fn format_mmss(seconds: i64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

const CSS: &str = "<style type='text/css'>\
 a:link, a:visited { text-decoration:none; }\n\
 a:hover, a:active { text-decoration:underline; }\n\
 .filter_sel { font-weight:bold; padding: 5px 15px; border-radius: 5px; }\n\
 .active { background-color:#a0a0ff; }\n\
 .inactive { background-color:#e0e0e0; color:#000000; }\n\
 .inactive:hover { background-color:#e0e0ff; }\n\
</style>";

fn append_file_info(page: &mut String, progress_color: &str, stats: &HandlerStats) {
    page.push_str("<tr style='white-space:nowrap;'>");
    let status = match stats.status {
        HandlerStatus::Open => "open",
        HandlerStatus::Idle => "idle",
        HandlerStatus::Retired => "&nbsp;----&nbsp;",
    };

    if !stats.message.is_empty() {
        page.push_str(&format!(
            "<td>{status}</td><td colspan='3' style='font-size:small;'>{}</td>",
            html_escape(&stats.message)
        ));
    } else if stats.buffer_progress <= 0.0 {
        page.push_str(&format!(
            "<td>{status}</td><td colspan='3' style='font-size:small;'>Only header accessed</td>",
        ));
    } else {
        let bar = (f64::from(PROGRESS_WIDTH_PX) * f64::from(stats.buffer_progress)) as u32;
        page.push_str(&format!(
            "<td>{status}</td><td>{}</td>\
             <td><div style='background:white;width:{PROGRESS_WIDTH_PX}px;border:1px solid black;'>\
             <div style='width:{bar}px;background:{progress_color};'>&nbsp;</div></div></td>\
             <td>{}</td>",
            if stats.in_gapless { "&rarr;" } else { "" },
            if stats.out_gapless { "&rarr;" } else { "" },
        ));
    }

    if stats.duration_seconds >= 0 {
        let played = (f64::from(stats.buffer_progress.max(0.0))
            * stats.duration_seconds as f64) as i64;
        page.push_str(&format!(
            "<td align='right'>{}</td><td>/</td><td align='right'>{}</td>",
            format_mmss(played),
            format_mmss(stats.duration_seconds)
        ));
    } else {
        page.push_str("<td colspan='3'>-</td>");
    }

    if stats.max_output_value > 1e-6 {
        let db = 20.0 * f64::from(stats.max_output_value).log10();
        let color = if stats.max_output_value > 1.0 {
            "#ff0505"
        } else {
            "white"
        };
        page.push_str(&format!(
            "<td align='right' style='background:{color};'>{db:.1} dB</td>"
        ));
    } else {
        page.push_str("<td>-</td>");
    }

    let filter = if stats.filter_dir.is_empty() {
        "pass-through"
    } else {
        &stats.filter_dir
    };
    page.push_str(&format!(
        "<td bgcolor='#c0c0c0'>&nbsp;{} ({})&nbsp;</td>\
         <td style='font-size:small;white-space:nowrap;'>{}</td></tr>\n",
        html_escape(&stats.format),
        html_escape(filter),
        html_escape(&stats.filename)
    ));
}

fn append_settings(page: &mut String, inner: &Inner) {
    page.push_str("<p>Active filter: ");
    let current = inner.fs.current_config_index();
    for (i, name) in inner.fs.config_dirs().iter().enumerate() {
        let label = if name.is_empty() {
            "None : Pass Through"
        } else {
            name
        };
        page.push_str("&nbsp;");
        if current == Some(i) {
            page.push_str(&format!(
                "<span class='filter_sel active'>{}</span>\n",
                html_escape(label)
            ));
        } else {
            page.push_str(&format!(
                "<a class='filter_sel inactive' href='{SETTINGS_URL}?f={i}'>{}</a>\n",
                html_escape(label)
            ));
        }
    }
    if inner.fs.config_dirs().len() == 1 {
        page.push_str(
            " (This is a boring configuration, add filter directories with \
             -c &lt;dir&gt; [-c &lt;another-dir&gt; ...])",
        );
    } else if inner.filter_switched.swap(false, Ordering::Relaxed) {
        page.push_str(
            "&nbsp;<span style='font-size:small;background:#ffffa0;'>\
             (Affects re- or newly opened files.)</span>",
        );
    }
    page.push_str("</p><hr/>");
}

fn create_page(inner: &Inner) -> String {
    let start = current_time();
    let mut page = String::with_capacity(16 << 10);
    page.push_str("<html><head><title>Folve</title>\n");
    if inner.meta_refresh_seconds > 0 {
        page.push_str(&format!(
            "<meta http-equiv='refresh' content='{}'>\n",
            inner.meta_refresh_seconds
        ));
    }
    page.push_str(CSS);
    page.push_str("</head>\n<body style='font-family:Sans-Serif;'>\n");
    page.push_str(&format!(
        "<center style='background-color:#a0ffa0;'>Folve {}</center>\n\
         Convolving audio files from <code>{}</code>\n",
        env!("CARGO_PKG_VERSION"),
        html_escape(&inner.fs.underlying_dir().display().to_string())
    ));

    append_settings(&mut page, inner);

    let mut stat_list = inner.fs.handler_cache().get_stats();

    let mut active_seen = 0.0f64;
    let mut active_filtered = 0.0f64;
    for stats in &stat_list {
        if stats.duration_seconds >= 0 && stats.buffer_progress >= 0.0 {
            active_seen += stats.duration_seconds as f64;
            active_filtered += stats.duration_seconds as f64 * f64::from(stats.buffer_progress);
        }
    }
    let (seen, filtered) = {
        let totals = inner.totals.lock().unwrap_or_else(|e| e.into_inner());
        (
            (totals.seconds_seen + active_seen) as i64,
            (totals.seconds_filtered + active_filtered) as i64,
        )
    };
    page.push_str(&format!(
        "Total opening files <b>{}</b> .. and re-opened from recency cache <b>{}</b><br/>\n",
        inner.fs.total_file_openings(),
        inner.fs.total_file_reopen()
    ));
    page.push_str(&format!(
        "Total music seen <b>{}</b> .. and convolved <b>{}</b> ({:.1}%)<br/>\n",
        format_duration(seen),
        format_duration(filtered),
        if seen == 0 {
            0.0
        } else {
            100.0 * filtered as f64 / seen as f64
        }
    ));

    page.push_str(&format!(
        "<h3>Accessed Recently</h3>\n{} in recency cache\n",
        stat_list.len()
    ));
    if inner.fs.gapless_processing() {
        page.push_str("<br/>&rarr; : denotes gapless transfers\n");
    }
    page.push_str(&format!(
        "<table>\n<tr><th>Stat</th><td></td><th width='{PROGRESS_WIDTH_PX}px'>Progress</th>\
         <td></td><th>Pos</th><td></td><th>Len</th><th>Max&nbsp;out</th>\
         <th>Format&nbsp;(filter)</th><th align='left'>File</th></tr>\n"
    ));
    // Open before idle, then by recency.
    stat_list.sort_by(|a, b| {
        a.status
            .cmp(&b.status)
            .then(b.last_access.total_cmp(&a.last_access))
    });
    for stats in &stat_list {
        append_file_info(&mut page, "#7070ff", stats);
    }
    page.push_str("</table><hr/>\n");

    {
        let retired = inner.retired.lock().unwrap_or_else(|e| e.into_inner());
        if !retired.is_empty() {
            page.push_str("<h3>Retired</h3>\n<table>\n");
            for stats in retired.iter() {
                append_file_info(&mut page, "#d0d0d0", stats);
            }
            page.push_str("</table>\n");
            let expunged = inner.expunged_retired.load(Ordering::Relaxed);
            if expunged > 0 {
                page.push_str(&format!("... ({expunged} more)<p></p>"));
            }
            page.push_str("<hr/>");
        }
    }

    page.push_str(&format!(
        "<span style='float:left;font-size:small;'>page-gen {:.2}ms</span>\
         </body></html>\n",
        (current_time() - start) * 1000.0
    ));
    page
}
