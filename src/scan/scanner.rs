use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{select, unbounded, Receiver};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::api::RequestClock;
use crate::error::{classify_response, ErrorKind};
use crate::net::codec::{CodecError, TransportCodec};
use crate::net::session::{
    Payload, SessionClient, SessionConfig, SessionError, CMD_FIELD_ENTER, CMD_ZONE_ENTER,
    CMD_ZONE_LEAVE, EVENT_DISCONNECT, EVENT_FIELD_ENTER, EVENT_FIELD_OBJECTS,
};
use crate::net::sio::EventData;
use crate::net::ws::Connector;
use crate::tasks::shutdown::Shutdown;
use crate::world::coordinate::Coordinate;
use crate::world::filter::{self, MatchRecord, NamePredicate};
use crate::world::objects::parse_objects;
use crate::world::zone::{ZoneId, ZoneIndex};

/// Zones entered and left once after field entry, before the real scan.
const WARMUP_ZONES: [ZoneId; 4] = [0, 64, 1, 65];

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub batch_size: usize,
    pub max_batches_per_pass: usize,
    pub max_radius: u32,
    /// With at least one match, no pass beyond the first radius above this runs.
    pub early_stop_radius: u32,
    pub entered_timeout: Duration,
    pub objects_timeout: Duration,
    pub warmup_grace: Duration,
    pub pacing_interval: Duration,
    pub pacing_poll: Duration,
    pub session: SessionConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 9,
            max_batches_per_pass: 7,
            max_radius: 32,
            early_stop_radius: 16,
            entered_timeout: Duration::from_secs(30),
            objects_timeout: Duration::from_secs(20),
            warmup_grace: Duration::from_secs(2),
            pacing_interval: Duration::from_secs(16),
            pacing_poll: Duration::from_secs(4),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanTarget {
    pub origin: Coordinate,
    pub field_url: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub matches: Vec<MatchRecord>,
    /// Passes run.
    pub radii_scanned: u32,
    /// Zone distance from the origin reached by the farthest entered zone.
    pub frontier_radius: u32,
    /// Zone distance of the nearest match.
    pub first_match_radius: Option<u32>,
    pub zones_visited: usize,
    pub batches_skipped: usize,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("session token unusable: {0}")]
    Token(#[source] CodecError),
    #[error("timed out after {after:?} waiting for {event}")]
    Timeout { event: &'static str, after: Duration },
    #[error("push channel lost: {0}")]
    ChannelLost(String),
    #[error("scan cancelled")]
    Cancelled,
    #[error("service refused: {0}")]
    Service(ErrorKind),
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::Session(err) => err.kind(),
            ScanError::Service(kind) => kind.clone(),
            _ => ErrorKind::Unclassified,
        }
    }
}

/// Per-scan state; lives on the scanning thread only.
struct ScanSession {
    world_id: i64,
    center: (u32, u32),
    visited: HashSet<ZoneId>,
    report: ScanReport,
}

struct Inbox {
    entered: Receiver<Value>,
    objects: Receiver<EventData>,
    lost: Receiver<String>,
}

/// Expanding-radius harvest of kingdom snapshots around an origin.
pub struct ZoneScanner {
    connector: Arc<dyn Connector>,
    clock: Arc<dyn RequestClock>,
    shutdown: Shutdown,
    index: ZoneIndex,
    config: ScanConfig,
}

impl ZoneScanner {
    pub fn new(connector: Arc<dyn Connector>, clock: Arc<dyn RequestClock>, shutdown: Shutdown) -> Self {
        Self {
            connector,
            clock,
            shutdown,
            index: ZoneIndex::default(),
            config: ScanConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ScanConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_index(mut self, index: ZoneIndex) -> Self {
        self.index = index;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn scan(&self, target: &ScanTarget, predicate: &NamePredicate) -> Result<ScanReport, ScanError> {
        self.with_session(target, |session, inbox, codec, world_id| {
            self.warm_up(session, inbox, world_id)?;
            self.expand(session, inbox, codec, world_id, target, predicate)
        })
    }

    /// Enters the field, takes one snapshot of the zones around the origin and
    /// keeps the session open for `hold`. Returns the number of kingdoms seen.
    pub fn watch(&self, target: &ScanTarget, hold: Duration) -> Result<usize, ScanError> {
        self.with_session(target, |session, inbox, codec, world_id| {
            let (center_x, center_y) = self.index.zone_of_tile(target.origin.x, target.origin.y);
            let zones = self.index.zones_within_radius(center_x, center_y, 1);
            let kingdoms = match self.batch(session, inbox, codec, world_id, &zones) {
                Ok(snapshot) => parse_objects(&snapshot)
                    .iter()
                    .filter(|object| object.is_kingdom())
                    .count(),
                Err(BatchError::Decode(err)) => {
                    log::warn!("home snapshot unreadable: {err}");
                    0
                }
                Err(BatchError::Scan(err)) => return Err(err),
            };
            log::info!(
                "world {world_id}: {kingdoms} kingdom(s) in the {} zones around {}",
                zones.len(),
                target.origin
            );
            self.hold(inbox, hold)?;
            Ok(kingdoms)
        })
    }

    /// Paces, connects, enters the field and runs `body`; the session is
    /// always disconnected afterwards.
    fn with_session<T>(
        &self,
        target: &ScanTarget,
        body: impl FnOnce(&SessionClient, &Inbox, &TransportCodec, i64) -> Result<T, ScanError>,
    ) -> Result<T, ScanError> {
        self.pace()?;
        let codec = TransportCodec::for_token(&target.token).map_err(ScanError::Token)?;
        let mut session = SessionClient::new(
            Arc::clone(&self.connector),
            self.config.session.clone(),
            codec.clone(),
        );
        let inbox = subscribe(&session);

        session.connect(&target.field_url, &target.token)?;
        self.clock.record_request(SystemTime::now());
        let result = self
            .enter_field(&session, &inbox, &codec, target)
            .and_then(|world_id| body(&session, &inbox, &codec, world_id));
        session.disconnect();
        result
    }

    fn enter_field(
        &self,
        session: &SessionClient,
        inbox: &Inbox,
        codec: &TransportCodec,
        target: &ScanTarget,
    ) -> Result<i64, ScanError> {
        session.emit(CMD_FIELD_ENTER, Payload::Encoded(json!({ "token": target.token })))?;
        let ack = self.wait(&inbox.entered, inbox, EVENT_FIELD_ENTER, self.config.entered_timeout)?;
        let ack = decode_ack(codec, &ack);
        if let Some(kind) = classify_response(&ack) {
            return Err(ScanError::Service(kind));
        }
        let world_id = match entered_world(&ack) {
            Some(world_id) => world_id,
            None => {
                log::warn!(
                    "field entry ack without location; using profile world {}",
                    target.origin.world_id
                );
                target.origin.world_id
            }
        };
        session.mark_entered(world_id);
        log::info!("entered field on world {world_id}");
        Ok(world_id)
    }

    fn expand(
        &self,
        session: &SessionClient,
        inbox: &Inbox,
        codec: &TransportCodec,
        world_id: i64,
        target: &ScanTarget,
        predicate: &NamePredicate,
    ) -> Result<ScanReport, ScanError> {
        let mut scan = ScanSession {
            world_id,
            center: self.index.zone_of_tile(target.origin.x, target.origin.y),
            visited: HashSet::new(),
            report: ScanReport::default(),
        };
        for radius in 1..=self.config.max_radius {
            if !self.shutdown.is_running() {
                return Err(ScanError::Cancelled);
            }
            self.pass(session, inbox, codec, &mut scan, radius, predicate)?;
            scan.report.radii_scanned = radius;
            // Zone distance reached, not pass count.
            let frontier = scan.report.frontier_radius;
            if !scan.report.matches.is_empty() && frontier > self.config.early_stop_radius {
                log::info!(
                    "stopping at distance {frontier} after {radius} passes with {} match(es)",
                    scan.report.matches.len()
                );
                break;
            }
        }
        scan.report.zones_visited = scan.visited.len();
        Ok(scan.report)
    }

    /// Keeps the channel open until `hold` elapses, shutdown, or channel loss.
    fn hold(&self, inbox: &Inbox, hold: Duration) -> Result<(), ScanError> {
        let watch = self.shutdown.watch();
        select! {
            recv(inbox.lost) -> reason => {
                Err(ScanError::ChannelLost(reason.unwrap_or_else(|_| "session closed".to_string())))
            }
            recv(watch) -> _ => Err(ScanError::Cancelled),
            default(hold) => Ok(()),
        }
    }

    /// Waits until the last API request is old enough to open the channel.
    fn pace(&self) -> Result<(), ScanError> {
        let watch = self.shutdown.watch();
        loop {
            if !self.shutdown.is_running() {
                return Err(ScanError::Cancelled);
            }
            let Some(last) = self.clock.last_request_at() else {
                return Ok(());
            };
            let elapsed = SystemTime::now()
                .duration_since(last)
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.config.pacing_interval {
                return Ok(());
            }
            let remaining = self.config.pacing_interval - elapsed;
            log::debug!("pacing: {}s until the channel may open", remaining.as_secs());
            select! {
                recv(watch) -> _ => return Err(ScanError::Cancelled),
                default(remaining.min(self.config.pacing_poll)) => {}
            }
        }
    }

    fn warm_up(&self, session: &SessionClient, inbox: &Inbox, world_id: i64) -> Result<(), ScanError> {
        session.emit(CMD_ZONE_LEAVE, Payload::Plain(zone_payload(world_id, &[])))?;
        session.emit(CMD_ZONE_ENTER, Payload::Encoded(zone_payload(world_id, &WARMUP_ZONES)))?;
        session.emit(CMD_ZONE_LEAVE, Payload::Plain(zone_payload(world_id, &WARMUP_ZONES)))?;
        match self.wait(&inbox.objects, inbox, EVENT_FIELD_OBJECTS, self.config.warmup_grace) {
            Ok(_) | Err(ScanError::Timeout { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn pass(
        &self,
        session: &SessionClient,
        inbox: &Inbox,
        codec: &TransportCodec,
        scan: &mut ScanSession,
        radius: u32,
        predicate: &NamePredicate,
    ) -> Result<(), ScanError> {
        let (center_x, center_y) = scan.center;
        let mut pending: Vec<ZoneId> = self
            .index
            .zones_within_radius(center_x, center_y, radius)
            .into_iter()
            .filter(|zone| !scan.visited.contains(zone))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        // Stable: ties stay row-major.
        pending.sort_by_key(|&zone| self.index.distance(zone, center_x, center_y));

        let batch_size = self.config.batch_size.max(1);
        for batch in pending.chunks(batch_size).take(self.config.max_batches_per_pass) {
            scan.visited.extend(batch.iter().copied());
            let batch_distance = batch
                .iter()
                .map(|&zone| self.index.distance(zone, center_x, center_y))
                .max()
                .unwrap_or(radius);
            scan.report.frontier_radius = scan.report.frontier_radius.max(batch_distance);
            match self.batch(session, inbox, codec, scan.world_id, batch) {
                Ok(snapshot) => {
                    let found = filter::matches(&parse_objects(&snapshot), predicate);
                    for record in &found {
                        let distance = self
                            .record_distance(record, scan.center)
                            .unwrap_or(batch_distance);
                        log::info!("distance {distance}: {record}");
                        let nearest = scan.report.first_match_radius.get_or_insert(distance);
                        *nearest = (*nearest).min(distance);
                    }
                    scan.report.matches.extend(found);
                }
                Err(BatchError::Decode(err)) => {
                    scan.report.batches_skipped += 1;
                    log::warn!("radius {radius}: skipping batch {batch:?}: {err}");
                }
                Err(BatchError::Scan(err)) => return Err(err),
            }
        }
        Ok(())
    }

    fn batch(
        &self,
        session: &SessionClient,
        inbox: &Inbox,
        codec: &TransportCodec,
        world_id: i64,
        zones: &[ZoneId],
    ) -> Result<Value, BatchError> {
        // Late snapshots from an earlier batch must not be attributed to this one.
        while inbox.objects.try_recv().is_ok() {}

        session
            .emit(CMD_ZONE_ENTER, Payload::Encoded(zone_payload(world_id, zones)))
            .map_err(|err| BatchError::Scan(err.into()))?;
        let waited = self.wait(&inbox.objects, inbox, EVENT_FIELD_OBJECTS, self.config.objects_timeout);
        let left = session.emit(CMD_ZONE_LEAVE, Payload::Plain(zone_payload(world_id, zones)));
        let data = waited.map_err(BatchError::Scan)?;
        left.map_err(|err| BatchError::Scan(err.into()))?;

        if let Some(kind) = classify_response(&data.value) {
            return Err(BatchError::Scan(ScanError::Service(kind)));
        }
        let packs = data.bytes("packs").ok_or(CodecError::Empty)?;
        let snapshot = codec.decode_packed(&packs)?;
        if let Some(kind) = classify_response(&snapshot) {
            return Err(BatchError::Scan(ScanError::Service(kind)));
        }
        Ok(snapshot)
    }

    /// Zone distance of a match from its own coordinates, when it has them.
    fn record_distance(&self, record: &MatchRecord, center: (u32, u32)) -> Option<u32> {
        let x = u32::try_from(record.coordinates.x?).ok()?;
        let y = u32::try_from(record.coordinates.y?).ok()?;
        let (zone_x, zone_y) = self.index.zone_of_tile(x, y);
        Some(self.index.distance(self.index.to_zone_id(zone_x, zone_y), center.0, center.1))
    }

    fn wait<T>(
        &self,
        rx: &Receiver<T>,
        inbox: &Inbox,
        event: &'static str,
        timeout: Duration,
    ) -> Result<T, ScanError> {
        let watch = self.shutdown.watch();
        select! {
            recv(rx) -> message => {
                message.map_err(|_| ScanError::ChannelLost(format!("{event} handler dropped")))
            }
            recv(inbox.lost) -> reason => {
                Err(ScanError::ChannelLost(reason.unwrap_or_else(|_| "session closed".to_string())))
            }
            recv(watch) -> _ => Err(ScanError::Cancelled),
            default(timeout) => Err(ScanError::Timeout { event, after: timeout }),
        }
    }
}

enum BatchError {
    Decode(CodecError),
    Scan(ScanError),
}

impl From<CodecError> for BatchError {
    fn from(err: CodecError) -> Self {
        BatchError::Decode(err)
    }
}

fn subscribe(session: &SessionClient) -> Inbox {
    let (entered_tx, entered) = unbounded();
    let (objects_tx, objects) = unbounded();
    let (lost_tx, lost) = unbounded();
    session.subscribe(EVENT_FIELD_ENTER, move |event| {
        let _ = entered_tx.send(event.data.value.clone());
    });
    session.subscribe(EVENT_FIELD_OBJECTS, move |event| {
        let _ = objects_tx.send(event.data.clone());
    });
    session.subscribe(EVENT_DISCONNECT, move |event| {
        let reason = event
            .data
            .value
            .as_str()
            .unwrap_or("connection lost")
            .to_string();
        let _ = lost_tx.send(reason);
    });
    Inbox {
        entered,
        objects,
        lost,
    }
}

/// Field-entry ack body; encoded acks that fail to decode are kept as sent.
fn decode_ack(codec: &TransportCodec, ack: &Value) -> Value {
    match ack {
        Value::String(text) => codec.decode(text).unwrap_or_else(|_| ack.clone()),
        other => other.clone(),
    }
}

/// World id from a decoded field-entry ack (`loc: [world, x, y]`).
fn entered_world(ack: &Value) -> Option<i64> {
    ack.get("loc")?.get(0)?.as_i64()
}

fn zone_payload(world_id: i64, zones: &[ZoneId]) -> Value {
    let list = serde_json::to_string(zones).unwrap_or_else(|_| "[]".to_string());
    json!({ "world": world_id, "zones": list })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SharedRequestClock;
    use crate::error::{FatalKind, RetryableKind};
    use crate::net::testing::{FakeConnector, FakeKingdom, FakeServerOptions};
    use crate::net::xor::token_with_claims;
    use crate::world::filter::name_contains;
    use std::thread;
    use std::time::Instant;

    fn token() -> String {
        token_with_claims(&json!({"uid": "u1", "clientXor": "fieldscout"}))
    }

    fn target() -> ScanTarget {
        ScanTarget {
            origin: Coordinate::new(24, 1024, 1024),
            field_url: "ws://fake.local".to_string(),
            token: token(),
        }
    }

    fn fast_config() -> ScanConfig {
        ScanConfig {
            entered_timeout: Duration::from_millis(500),
            objects_timeout: Duration::from_millis(500),
            warmup_grace: Duration::from_millis(200),
            pacing_interval: Duration::from_millis(0),
            ..ScanConfig::default()
        }
    }

    fn connector(options: FakeServerOptions) -> FakeConnector {
        let codec = TransportCodec::for_token(&token()).expect("codec");
        FakeConnector::new(codec, options)
    }

    fn scanner(connector: &FakeConnector, config: ScanConfig) -> ZoneScanner {
        ZoneScanner::new(
            Arc::new(connector.clone()),
            Arc::new(SharedRequestClock::new()),
            Shutdown::new(),
        )
        .with_config(config)
    }

    #[test]
    fn finds_kingdom_three_zones_out() {
        let fake = connector(FakeServerOptions {
            kingdoms: vec![
                FakeKingdom::in_zone("Foo", 35, 32),
                FakeKingdom::in_zone("Bar", 31, 31),
            ],
            ..FakeServerOptions::default()
        });
        let predicate = name_contains("foo");
        let report = scanner(&fake, fast_config())
            .scan(&target(), &predicate)
            .expect("scan");
        assert_eq!(report.matches.len(), 1);
        let record = &report.matches[0];
        assert_eq!(record.player_name, "Foo");
        assert_eq!(record.coordinates.x, Some(35 * 32));
        assert_eq!(record.coordinates.world, Some(24));
        assert_eq!(report.first_match_radius, Some(3));
        assert_eq!(report.frontier_radius, 17);
        assert_eq!(report.batches_skipped, 0);
    }

    #[test]
    fn no_match_runs_every_radius() {
        let fake = connector(FakeServerOptions {
            kingdoms: vec![FakeKingdom::in_zone("Bar", 33, 33)],
            ..FakeServerOptions::default()
        });
        let predicate = name_contains("nobody");
        let report = scanner(&fake, fast_config())
            .scan(&target(), &predicate)
            .expect("scan");
        assert!(report.matches.is_empty());
        assert_eq!(report.radii_scanned, 32);
        assert_eq!(report.first_match_radius, None);
        // 1800 zones reach into ring 21 (41 * 41 = 1681 < 1800 < 43 * 43).
        assert_eq!(report.frontier_radius, 21);
        // Passes 1..=7 take whole rings; from pass 8 on the batch cap (63 zones) binds.
        assert_eq!(report.zones_visited, 225 + 25 * 63);
    }

    #[test]
    fn stops_at_the_radius_of_a_late_first_match() {
        let fake = connector(FakeServerOptions {
            kingdoms: vec![FakeKingdom::in_zone("Far", 52, 32)],
            ..FakeServerOptions::default()
        });
        let config = ScanConfig {
            max_batches_per_pass: usize::MAX,
            ..fast_config()
        };
        let predicate = name_contains("far");
        let report = scanner(&fake, config)
            .scan(&target(), &predicate)
            .expect("scan");
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.first_match_radius, Some(20));
        assert_eq!(report.radii_scanned, 20);
        assert_eq!(report.frontier_radius, 20);
    }

    #[test]
    fn capped_passes_still_stop_at_the_match_distance() {
        let fake = connector(FakeServerOptions {
            kingdoms: vec![FakeKingdom::in_zone("Far", 52, 32)],
            ..FakeServerOptions::default()
        });
        let predicate = name_contains("far");
        let report = scanner(&fake, fast_config())
            .scan(&target(), &predicate)
            .expect("scan");
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.first_match_radius, Some(20));
        assert_eq!(report.frontier_radius, 20);
        assert!(report.radii_scanned > 20);
    }

    #[test]
    fn close_match_still_scans_past_the_early_stop_radius() {
        let fake = connector(FakeServerOptions {
            kingdoms: vec![FakeKingdom::in_zone("Near", 30, 32)],
            ..FakeServerOptions::default()
        });
        let predicate = name_contains("near");
        let report = scanner(&fake, fast_config())
            .scan(&target(), &predicate)
            .expect("scan");
        assert_eq!(report.first_match_radius, Some(2));
        assert_eq!(report.frontier_radius, 17);
    }

    #[test]
    fn batches_alternate_enter_and_leave_without_revisits() {
        let fake = connector(FakeServerOptions::default());
        let log = fake.command_log();
        let config = ScanConfig {
            max_radius: 5,
            ..fast_config()
        };
        let predicate = name_contains("x");
        scanner(&fake, config).scan(&target(), &predicate).expect("scan");

        let commands = log.zone_commands();
        assert_eq!(commands[0], (CMD_ZONE_LEAVE.to_string(), vec![]));
        assert_eq!(commands[1], (CMD_ZONE_ENTER.to_string(), WARMUP_ZONES.to_vec()));
        assert_eq!(commands[2], (CMD_ZONE_LEAVE.to_string(), WARMUP_ZONES.to_vec()));

        let index = ZoneIndex::default();
        let mut seen = HashSet::new();
        let mut last_distance = 0;
        for pair in commands[3..].chunks(2) {
            assert_eq!(pair.len(), 2);
            let (enter, zones) = &pair[0];
            let (leave, left) = &pair[1];
            assert_eq!(enter, CMD_ZONE_ENTER);
            assert_eq!(leave, CMD_ZONE_LEAVE);
            assert_eq!(zones, left);
            assert!(!zones.is_empty() && zones.len() <= 9);
            for zone in zones {
                assert!(seen.insert(*zone), "zone {zone} entered twice");
                let distance = index.distance(*zone, 32, 32);
                assert!(distance >= last_distance, "zone {zone} out of distance order");
                last_distance = distance;
            }
        }
        assert_eq!(seen.len(), 11 * 11);
        assert_eq!(commands[3].1[0], index.to_zone_id(32, 32));
    }

    #[test]
    fn undecodable_batch_is_skipped() {
        let fake = connector(FakeServerOptions {
            kingdoms: vec![FakeKingdom::in_zone("Foo", 35, 32)],
            corrupt_enters: vec![2],
            ..FakeServerOptions::default()
        });
        let predicate = name_contains("foo");
        let report = scanner(&fake, fast_config())
            .scan(&target(), &predicate)
            .expect("scan");
        assert_eq!(report.batches_skipped, 1);
        assert_eq!(report.matches.len(), 1);
    }

    #[test]
    fn missing_field_ack_times_out() {
        let fake = connector(FakeServerOptions {
            silent_enter: true,
            ..FakeServerOptions::default()
        });
        let predicate = name_contains("foo");
        let err = scanner(&fake, fast_config())
            .scan(&target(), &predicate)
            .expect_err("timeout");
        assert!(matches!(err, ScanError::Timeout { event: EVENT_FIELD_ENTER, .. }));
        assert_eq!(err.kind(), ErrorKind::Unclassified);
    }

    #[test]
    fn missing_snapshot_times_out_after_leaving() {
        let fake = connector(FakeServerOptions {
            stall_from_enter: Some(1),
            ..FakeServerOptions::default()
        });
        let log = fake.command_log();
        let predicate = name_contains("foo");
        let err = scanner(&fake, fast_config())
            .scan(&target(), &predicate)
            .expect_err("timeout");
        assert!(matches!(err, ScanError::Timeout { event: EVENT_FIELD_OBJECTS, .. }));
        let commands = log.zone_commands();
        let (name, zones) = commands.last().expect("commands");
        assert_eq!(name, CMD_ZONE_LEAVE);
        assert_eq!(zones.len(), 9);
    }

    #[test]
    fn shutdown_cancels_a_waiting_scan() {
        let fake = connector(FakeServerOptions {
            stall_from_enter: Some(1),
            ..FakeServerOptions::default()
        });
        let config = ScanConfig {
            objects_timeout: Duration::from_secs(30),
            ..fast_config()
        };
        let shutdown = Shutdown::new();
        let scanner = ZoneScanner::new(
            Arc::new(fake.clone()),
            Arc::new(SharedRequestClock::new()),
            shutdown.clone(),
        )
        .with_config(config);
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(400));
            shutdown.request();
        });
        let started = Instant::now();
        let predicate = name_contains("foo");
        let err = scanner.scan(&target(), &predicate).expect_err("cancelled");
        assert!(matches!(err, ScanError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        trigger.join().expect("trigger");
    }

    #[test]
    fn pacing_waits_for_recent_requests_and_is_cancellable() {
        let fake = connector(FakeServerOptions::default());
        let clock = Arc::new(SharedRequestClock::new());
        clock.touch();
        let shutdown = Shutdown::new();
        let config = ScanConfig {
            pacing_interval: Duration::from_secs(16),
            pacing_poll: Duration::from_secs(4),
            ..fast_config()
        };
        let scanner = ZoneScanner::new(Arc::new(fake.clone()), clock, shutdown.clone())
            .with_config(config);
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            shutdown.request();
        });
        let started = Instant::now();
        let predicate = name_contains("foo");
        let err = scanner.scan(&target(), &predicate).expect_err("cancelled");
        assert!(matches!(err, ScanError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(fake.command_log().commands().is_empty());
        trigger.join().expect("trigger");
    }

    #[test]
    fn rejected_upgrade_is_fatal_no_auth() {
        let fake = connector(FakeServerOptions {
            reject_status: Some(401),
            ..FakeServerOptions::default()
        });
        let predicate = name_contains("foo");
        let err = scanner(&fake, fast_config())
            .scan(&target(), &predicate)
            .expect_err("rejected");
        assert_eq!(err.kind(), ErrorKind::Fatal(FatalKind::NoAuth));
    }

    #[test]
    fn refused_field_entry_is_classified() {
        for (code, expected) in [
            ("no_auth", ErrorKind::Fatal(FatalKind::NoAuth)),
            ("need_captcha", ErrorKind::Fatal(FatalKind::CaptchaRequired)),
            ("not_online", ErrorKind::Fatal(FatalKind::NotOnline)),
        ] {
            let fake = connector(FakeServerOptions {
                kingdoms: vec![FakeKingdom::in_zone("Foo", 35, 32)],
                enter_error: Some(code.to_string()),
                ..FakeServerOptions::default()
            });
            let log = fake.command_log();
            let predicate = name_contains("foo");
            let err = scanner(&fake, fast_config())
                .scan(&target(), &predicate)
                .expect_err("refused");
            assert!(matches!(err, ScanError::Service(_)));
            assert_eq!(err.kind(), expected);
            assert!(log.zone_commands().is_empty());
        }
    }

    #[test]
    fn refused_snapshot_aborts_the_scan() {
        let fake = connector(FakeServerOptions {
            objects_error: Some("exceed_limit_packet".to_string()),
            ..FakeServerOptions::default()
        });
        let predicate = name_contains("foo");
        let err = scanner(&fake, fast_config())
            .scan(&target(), &predicate)
            .expect_err("refused");
        assert_eq!(err.kind(), ErrorKind::Retryable(RetryableKind::RateLimited));
    }

    #[test]
    fn opened_channels_pace_the_next_scan() {
        let fake = connector(FakeServerOptions::default());
        let clock = Arc::new(SharedRequestClock::new());
        let config = ScanConfig {
            pacing_interval: Duration::from_millis(300),
            ..fast_config()
        };
        let scanner = ZoneScanner::new(Arc::new(fake.clone()), clock.clone(), Shutdown::new())
            .with_config(config);

        scanner.watch(&target(), Duration::from_millis(10)).expect("first watch");
        assert!(clock.last_request_at().is_some());

        let started = Instant::now();
        scanner.watch(&target(), Duration::from_millis(10)).expect("second watch");
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn watch_counts_kingdoms_around_home() {
        let fake = connector(FakeServerOptions {
            kingdoms: vec![
                FakeKingdom::in_zone("Neighbour", 33, 31),
                FakeKingdom::in_zone("Distant", 40, 40),
            ],
            ..FakeServerOptions::default()
        });
        let log = fake.command_log();
        let kingdoms = scanner(&fake, fast_config())
            .watch(&target(), Duration::from_millis(10))
            .expect("watch");
        assert_eq!(kingdoms, 1);

        let commands = log.zone_commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].0, CMD_ZONE_ENTER);
        assert_eq!(commands[0].1.len(), 9);
        assert_eq!(commands[1], (CMD_ZONE_LEAVE.to_string(), commands[0].1.clone()));
    }

    #[test]
    fn ack_world_is_read_from_plain_or_encoded_payloads() {
        let codec = TransportCodec::for_token(&token()).expect("codec");
        let encoded = codec.encode(&json!({"loc": [7, 1, 2]})).expect("encode");
        assert_eq!(entered_world(&decode_ack(&codec, &Value::String(encoded))), Some(7));
        assert_eq!(entered_world(&decode_ack(&codec, &json!({"loc": [9, 1, 2]}))), Some(9));
        assert_eq!(entered_world(&json!({})), None);
        assert_eq!(zone_payload(3, &[0, 64])["zones"], "[0,64]");
    }
}
