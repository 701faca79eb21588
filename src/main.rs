//! mpris-notify: desktop notifications for MPRIS media players
//! - Pins one running player on the session bus and follows its
//!   PropertiesChanged signals (zbus 3.x), no polling.
//! - Track changes re-query Metadata, resolve the cover-art reference
//!   (file:// / http(s):// / data: base64) and decode it in memory.
//! - One notification at a time: the previous popup is closed before
//!   the next one is shown.
//! - Exits when the followed player drops off the bus.
//!
//! Notes:
//! - Everything runs on a single current-thread runtime; handlers take
//!   the session state by &mut, so there is exactly one writer.
//! - No unsafe. All steady-state failures degrade to defaults.

#![deny(unsafe_code)]
#![deny(clippy::all, clippy::pedantic, clippy::nursery, clippy::perf)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::too_many_lines,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine};
use bytes::Bytes;
use clap::Parser;
use futures_util::StreamExt;
use image::{imageops::FilterType, DynamicImage, RgbaImage};
use notify_rust::{Image, Notification, NotificationHandle, Timeout};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use zbus::{
    fdo::DBusProxy,
    names::BusName,
    zvariant::{OwnedValue, Value},
    Connection, MessageStream, MessageType, Proxy,
};

const APP_NAME: &str = "mpris-notify";
const UNKNOWN: &str = "Unknown";
const NOTE: &str = "\u{266b}";
const FALLBACK_ICON: &str = "media-optical";

const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2.";
const MPRIS_PATH: &str = "/org/mpris/MediaPlayer2";
const PLAYER_IFACE: &str = "org.mpris.MediaPlayer2.Player";
const NO_TRACK: &str = "/org/mpris/MediaPlayer2/TrackList/NoTrack";

// ------------------------- Config -------------------------

#[derive(Debug, Default, Deserialize)]
struct Config {
    #[serde(default)]
    player: PlayerConfig,
    #[serde(default)]
    art: ArtConfig,
    #[serde(default)]
    notify: NotifyConfig,
}

#[derive(Debug, Deserialize)]
struct PlayerConfig {
    #[serde(default = "default_priority")]
    priority: Vec<String>,
    #[serde(default = "fallback_any")]
    fallback: String, // "any" | "none"
}
fn default_priority() -> Vec<String> {
    vec![
        "spotify".into(),
        "mpd".into(),
        "vlc".into(),
        "mpv".into(),
        "firefox".into(),
    ]
}
fn fallback_any() -> String {
    "any".into()
}
impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            fallback: fallback_any(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ArtConfig {
    #[serde(default = "dtrue")]
    enabled: bool,
    #[serde(default = "dtrue")]
    download_http: bool,
    #[serde(default = "d5000")]
    timeout_ms: u32,
}
fn dtrue() -> bool {
    true
}
fn d5000() -> u32 {
    5000
}
impl Default for ArtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            download_http: true,
            timeout_ms: d5000(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NotifyConfig {
    #[serde(default = "d5000")]
    timeout_ms: u32,
    #[serde(default = "d48")]
    icon_size: u32,
}
fn d48() -> u32 {
    48
}
impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: d5000(),
            icon_size: d48(),
        }
    }
}

// ------------------------- Model/State -------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum PlaybackStatus {
    Playing,
    Paused,
    Stopped,
    #[default]
    Unknown,
}

impl PlaybackStatus {
    fn parse(s: &str) -> Self {
        match s {
            "Playing" => Self::Playing,
            "Paused" => Self::Paused,
            "Stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }

    fn summary(self) -> String {
        match self {
            Self::Playing => format!("{NOTE} Currently playing"),
            Self::Stopped => format!("{NOTE} Playback stopped"),
            Self::Paused => format!("{NOTE} Playback paused"),
            Self::Unknown => NOTE.to_string(),
        }
    }
}

/// The one current-track record. `track_id == None` means nothing is
/// playing and suppresses rendering.
#[derive(Debug, Default)]
struct CurrentTrack {
    status: PlaybackStatus,
    track_id: Option<String>,
    album: String,
    artist: String,
    title: String,
    track_number: i32,
    art_url: Option<String>,
    cover: Option<DynamicImage>,
}

impl CurrentTrack {
    // Full replace of everything except playback status. The previous
    // cover is dropped here, before any new fetch is issued.
    fn replace_from(&mut self, meta: TrackMetadata) {
        *self = Self {
            status: self.status,
            track_id: meta.track_id,
            album: meta.album.unwrap_or_else(|| UNKNOWN.into()),
            artist: meta.artist.unwrap_or_else(|| UNKNOWN.into()),
            title: meta.title.unwrap_or_else(|| UNKNOWN.into()),
            track_number: meta.track_number.unwrap_or(0),
            art_url: meta.art_url,
            cover: None,
        };
    }
}

struct Session {
    cfg: Config,
    track: CurrentTrack,
    notifier: Notifier,
}

impl Session {
    fn new(cfg: Config) -> Self {
        Self {
            cfg,
            track: CurrentTrack::default(),
            notifier: Notifier::new(),
        }
    }
}

// ------------------------- Metadata -------------------------

/// Flattened view of the player's `Metadata` dict.
#[derive(Debug, Default, Clone, PartialEq)]
struct TrackMetadata {
    track_id: Option<String>,
    album: Option<String>,
    artist: Option<String>,
    title: Option<String>,
    track_number: Option<i32>,
    art_url: Option<String>,
}

impl TrackMetadata {
    fn from_dict(dict: &HashMap<String, OwnedValue>) -> Self {
        Self {
            track_id: dict_track_id(dict),
            album: dict_string(dict, "xesam:album"),
            artist: dict_string(dict, "xesam:artist"),
            title: dict_string(dict, "xesam:title"),
            track_number: dict_i32(dict, "xesam:trackNumber"),
            art_url: dict_string(dict, "mpris:artUrl"),
        }
    }
}

// xesam values are sometimes a plain string, sometimes an array of
// strings (artists); first entry wins.
fn dict_string(dict: &HashMap<String, OwnedValue>, key: &str) -> Option<String> {
    let v = dict.get(key)?;
    if let Ok(s) = String::try_from(v.clone()) {
        return Some(s);
    }
    Vec::<String>::try_from(v.clone())
        .ok()
        .and_then(|a| a.into_iter().next())
}

fn dict_i32(dict: &HashMap<String, OwnedValue>, key: &str) -> Option<i32> {
    let v = dict.get(key)?;
    if let Ok(n) = i32::try_from(v.clone()) {
        return Some(n);
    }
    if let Ok(n) = i64::try_from(v.clone()) {
        return i32::try_from(n).ok();
    }
    if let Ok(n) = u32::try_from(v.clone()) {
        return i32::try_from(n).ok();
    }
    None
}

// The trackid is an object path per the MPRIS spec, but some players
// send it as a plain string. The NoTrack path is the "nothing playing"
// sentinel and maps to None.
fn dict_track_id(dict: &HashMap<String, OwnedValue>) -> Option<String> {
    let id = match dict.get("mpris:trackid").map(|v| &**v) {
        Some(Value::ObjectPath(p)) => p.as_str().to_string(),
        Some(Value::Str(s)) => s.as_str().to_string(),
        _ => return None,
    };
    (id != NO_TRACK).then_some(id)
}

// ------------------------- Cover Art -------------------------

#[derive(Debug, PartialEq, Eq)]
enum ArtSource {
    File(PathBuf),
    Http(String),
    Inline(Vec<u8>),
    Unsupported,
}

fn classify_art_url(url: &str) -> ArtSource {
    let file_re = Regex::new(r"^file://").unwrap();
    let http_re = Regex::new(r"^https?://").unwrap();

    if file_re.is_match(url) {
        return ArtSource::File(PathBuf::from(url.trim_start_matches("file://")));
    }
    if http_re.is_match(url) {
        return ArtSource::Http(url.to_string());
    }
    if let Some((_media, b64)) = url
        .strip_prefix("data:image")
        .and_then(|s| s.split_once(";base64,"))
    {
        return match general_purpose::STANDARD.decode(b64) {
            Ok(bytes) => ArtSource::Inline(bytes),
            Err(e) => {
                warn!("bad base64 in art reference: {e}");
                ArtSource::Unsupported
            }
        };
    }
    ArtSource::Unsupported
}

async fn fetch_art_bytes(cfg: &ArtConfig, url: &str) -> Option<Vec<u8>> {
    match classify_art_url(url) {
        ArtSource::File(path) => match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!("reading cover {} failed: {e}", path.display());
                None
            }
        },
        ArtSource::Http(url) => {
            if !cfg.download_http {
                return None;
            }
            let client = reqwest::Client::builder()
                .timeout(Duration::from_millis(u64::from(cfg.timeout_ms)))
                .build()
                .ok()?;
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let bytes = resp.bytes().await.unwrap_or_else(|_| Bytes::new());
                    (!bytes.is_empty()).then(|| bytes.to_vec())
                }
                Ok(resp) => {
                    debug!("cover download {url} returned {}", resp.status());
                    None
                }
                Err(e) => {
                    debug!("cover download {url} failed: {e}");
                    None
                }
            }
        }
        ArtSource::Inline(bytes) => Some(bytes),
        ArtSource::Unsupported => None,
    }
}

fn decode_cover(bytes: &[u8]) -> Option<DynamicImage> {
    if bytes.is_empty() {
        return None;
    }
    match image::load_from_memory(bytes) {
        Ok(img) => Some(img),
        Err(e) => {
            warn!("cover art decode failed: {e}");
            None
        }
    }
}

async fn resolve_cover(cfg: &ArtConfig, url: &str) -> Option<DynamicImage> {
    if !cfg.enabled {
        return None;
    }
    let bytes = fetch_art_bytes(cfg, url).await?;
    decode_cover(&bytes)
}

// ------------------------- Notification -------------------------

struct Notifier {
    last: Option<NotificationHandle>,
}

impl Notifier {
    const fn new() -> Self {
        Self { last: None }
    }

    fn show(&mut self, track: &CurrentTrack, cfg: &NotifyConfig) {
        // Nothing playing, nothing to show.
        if track.track_id.is_none() {
            return;
        }

        if let Some(handle) = self.last.take() {
            handle.close();
        }

        let body = notification_body(track);
        let mut n = Notification::new();
        n.appname(APP_NAME)
            .summary(&track.status.summary())
            .body(&body)
            .timeout(Timeout::Milliseconds(cfg.timeout_ms));

        match track.cover.as_ref().and_then(|c| scaled_icon(c, cfg.icon_size)) {
            Some(icon) => {
                n.image_data(icon);
            }
            None => {
                n.icon(FALLBACK_ICON);
            }
        }

        match n.show() {
            Ok(handle) => self.last = Some(handle),
            Err(e) => warn!("showing notification failed: {e}"),
        }
    }
}

fn notification_body(track: &CurrentTrack) -> String {
    format!(
        "<big><b>{}</b></big>\n<small>by</small> {} <small>from</small> {} [{}]",
        markup_escape(&track.title),
        markup_escape(&track.artist),
        markup_escape(&track.album),
        track.track_number
    )
}

// `&` must be replaced first.
fn markup_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

fn scale_cover(cover: &DynamicImage, size: u32) -> RgbaImage {
    cover.resize_exact(size, size, FilterType::Triangle).to_rgba8()
}

fn scaled_icon(cover: &DynamicImage, size: u32) -> Option<Image> {
    let scaled = scale_cover(cover, size);
    let (w, h) = scaled.dimensions();
    match Image::from_rgba(w as i32, h as i32, scaled.into_raw()) {
        Ok(icon) => Some(icon),
        Err(e) => {
            warn!("cover not usable as notification icon: {e}");
            None
        }
    }
}

// ------------------------- Player selection -------------------------

fn pick_player(names: &[String], cfg: &PlayerConfig) -> Option<String> {
    let players: Vec<&String> = names.iter().filter(|n| n.starts_with(MPRIS_PREFIX)).collect();

    for want in &cfg.priority {
        if let Some(p) = players
            .iter()
            .find(|p| p[MPRIS_PREFIX.len()..].starts_with(want.as_str()))
        {
            return Some((**p).clone());
        }
    }
    if cfg.fallback == "any" {
        return players.first().map(|p| (**p).clone());
    }
    None
}

async fn select_player(dbus: &DBusProxy<'_>, cfg: &PlayerConfig) -> Result<String> {
    let names: Vec<String> = dbus
        .list_names()
        .await
        .context("listing bus names")?
        .into_iter()
        .map(|n| n.as_str().to_string())
        .collect();
    let bus = pick_player(&names, cfg).context("no running MPRIS player found")?;
    info!("following {bus}");
    Ok(bus)
}

// ------------------------- Queries -------------------------

async fn player_proxy<'a>(conn: &Connection, bus: &'a str) -> Result<Proxy<'a>> {
    Proxy::new(conn, bus, MPRIS_PATH, PLAYER_IFACE)
        .await
        .context("creating player proxy")
}

async fn query_status(player: &Proxy<'_>) -> zbus::Result<PlaybackStatus> {
    let status = player.get_property::<String>("PlaybackStatus").await?;
    Ok(PlaybackStatus::parse(&status))
}

async fn query_metadata(player: &Proxy<'_>) -> zbus::Result<TrackMetadata> {
    let dict = player
        .get_property::<HashMap<String, OwnedValue>>("Metadata")
        .await?;
    Ok(TrackMetadata::from_dict(&dict))
}

// ------------------------- Handlers -------------------------

// The id -> metadata -> cover -> render chain. `diagnose` echoes
// explicit query errors to stderr (one-shot mode); daemon mode falls
// back to defaults quietly.
async fn track_pipeline(session: &mut Session, player: &Proxy<'_>, diagnose: bool) {
    let meta = match query_metadata(player).await {
        Ok(meta) => meta,
        Err(e) => {
            if diagnose {
                eprintln!("{APP_NAME}: metadata query failed: {e}");
            } else {
                debug!("metadata query failed: {e}");
            }
            TrackMetadata::default()
        }
    };

    session.track.replace_from(meta);
    if let Some(url) = session.track.art_url.clone() {
        session.track.cover = resolve_cover(&session.cfg.art, &url).await;
    }
    session.notifier.show(&session.track, &session.cfg.notify);
}

async fn refresh_status(session: &mut Session, player: &Proxy<'_>, diagnose: bool) {
    match query_status(player).await {
        Ok(status) => session.track.status = status,
        Err(e) if diagnose => eprintln!("{APP_NAME}: status query failed: {e}"),
        Err(e) => debug!("status query failed: {e}"),
    }
}

// A status-only change keeps the last known metadata and re-renders; a
// signal carrying both keys applies the status first and renders once,
// after the track pipeline. Players that only invalidate a property
// get it re-queried.
async fn handle_properties_changed(
    session: &mut Session,
    player: &Proxy<'_>,
    changed: HashMap<String, OwnedValue>,
    invalidated: &[String],
) {
    let mut render = false;
    if let Some(v) = changed.get("PlaybackStatus") {
        if let Ok(s) = String::try_from(v.clone()) {
            session.track.status = PlaybackStatus::parse(&s);
            render = true;
        }
    } else if invalidated.iter().any(|p| p == "PlaybackStatus") {
        refresh_status(session, player, false).await;
        render = true;
    }

    if changed.contains_key("Metadata") || invalidated.iter().any(|p| p == "Metadata") {
        track_pipeline(session, player, false).await;
    } else if render {
        session.notifier.show(&session.track, &session.cfg.notify);
    }
}

// ------------------------- D-Bus (zbus) event loop -------------------------

async fn run_daemon(session: &mut Session, conn: &Connection) -> Result<()> {
    let dbus = DBusProxy::new(conn).await.context("dbus proxy")?;
    let bus = select_player(&dbus, &session.cfg.player).await?;

    // Subscribe before the initial queries so no change slips between
    // the seed and the stream.
    dbus.add_match(&format!(
        "type='signal',sender='{bus}',interface='org.freedesktop.DBus.Properties',member='PropertiesChanged',path='{MPRIS_PATH}'"
    ))
    .await
    .context("matching PropertiesChanged")?;
    dbus.add_match(&format!(
        "type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged',arg0='{bus}'"
    ))
    .await
    .context("matching NameOwnerChanged")?;

    // The object path is shared by every player; pin the unique name of
    // the one we follow so nobody else's signals slip in.
    let owner = dbus
        .get_name_owner(BusName::try_from(bus.as_str())?)
        .await
        .context("resolving name owner")?;

    let mut stream = MessageStream::from(conn);
    let player = player_proxy(conn, &bus).await?;

    // Seed: status first, then the track pipeline, mirroring the
    // signal-driven order.
    refresh_status(session, &player, false).await;
    track_pipeline(session, &player, false).await;

    while let Some(msg) = stream.next().await {
        let msg = msg?;
        let Ok(hdr) = msg.header() else { continue };
        if !matches!(hdr.message_type(), Ok(MessageType::Signal)) {
            continue;
        }

        let iface = hdr.interface().ok().flatten().map(|i| i.as_str().to_string());
        let member = hdr.member().ok().flatten().map(|m| m.as_str().to_string());

        match (iface.as_deref(), member.as_deref()) {
            (Some("org.freedesktop.DBus.Properties"), Some("PropertiesChanged")) => {
                let sender = hdr.sender().ok().flatten().map(|s| s.as_str().to_string());
                if sender.as_deref() != Some(owner.as_str()) {
                    continue;
                }
                let Ok((iface_name, changed, invalidated)) =
                    msg.body::<(String, HashMap<String, OwnedValue>, Vec<String>)>()
                else {
                    continue;
                };
                if iface_name != PLAYER_IFACE {
                    continue;
                }
                handle_properties_changed(session, &player, changed, &invalidated).await;
            }
            (Some("org.freedesktop.DBus"), Some("NameOwnerChanged")) => {
                let Ok((name, _old, new)) = msg.body::<(String, String, String)>() else {
                    continue;
                };
                if name == bus && new.is_empty() {
                    info!("{bus} left the bus, exiting");
                    break;
                }
            }
            _ => {}
        }
    }

    Ok(())
}

// ------------------------- One-shot -------------------------

async fn run_once(session: &mut Session, conn: &Connection) -> Result<()> {
    let dbus = DBusProxy::new(conn).await.context("dbus proxy")?;
    let bus = select_player(&dbus, &session.cfg.player).await?;
    let player = player_proxy(conn, &bus).await?;

    refresh_status(session, &player, true).await;
    track_pipeline(session, &player, true).await;
    Ok(())
}

// ------------------------- Config I/O -------------------------

fn read_config() -> Result<Config> {
    let Some(cfg_dir) = dirs::config_dir() else {
        return Ok(Config::default());
    };
    let path = cfg_dir.join(APP_NAME).join("config.toml");
    let Ok(text) = fs::read_to_string(&path) else {
        debug!("no config at {}, using defaults", path.display());
        return Ok(Config::default());
    };
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

// ------------------------- Main -------------------------

#[derive(Debug, Parser)]
#[command(name = APP_NAME, version, about = "Desktop notifications for MPRIS media players")]
struct Cli {
    /// Show one notification for the current track and exit.
    #[arg(short = 'c', long)]
    current: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = read_config()?;
    let conn = Connection::session()
        .await
        .context("connecting to the session bus")?;

    let mut session = Session::new(cfg);
    if cli.current {
        run_once(&mut session, &conn).await
    } else {
        run_daemon(&mut session, &conn).await
    }
}

// ------------------------- Tests -------------------------
