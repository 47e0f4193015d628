//! One reporting cycle: pick a transport, deliver the new measurement, and
//! either drain the backlog or park the measurement in the retry queue.
//!
//! A measurement leaves the retry queue only after the broker acknowledged
//! that exact entry, and nothing is ever dropped: every failure path ends in
//! [`RetryQueueStore::enqueue`].

use std::time::Duration;
use tracing::{error, info, warn};

use crate::downlink::{CommandHandler, DownlinkProtocol, SegmentStore};
use crate::error::{Result, UplinkError};
use crate::modem::ModemResponse;
use crate::net::{detections_topic, location_topic, Publisher, SensorIdentity};
use crate::selector::TransportSelector;
use crate::storage::RetryQueueStore;
use crate::types::{Command, DetectionPayload, LocationPayload, Measurement, Transport};

// Renewed before every publish; a crashed drainer's lease lapses after this.
const DRAIN_LEASE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
pub enum CycleOutcome {
    /// Published over Wi-Fi; `drained` backlog entries followed it.
    Delivered { drained: usize },
    /// Kept in the retry queue for a later cycle.
    Queued { reason: UplinkError },
    /// Accepted by the LoRa modem, possibly with a downlink command.
    SentOverLora { command: Option<Command> },
}

impl CycleOutcome {
    pub fn is_delivered(&self) -> bool {
        !matches!(self, Self::Queued { .. })
    }
}

pub struct UplinkPublisher<'a, S> {
    selector: &'a TransportSelector<'a>,
    queue: &'a dyn RetryQueueStore,
    mqtt: &'a dyn Publisher,
    downlink: &'a DownlinkProtocol<S>,
    handler: &'a dyn CommandHandler,
    identity: SensorIdentity,
    topic_prefix: String,
    drain_owner: String,
    drain_lease_ttl: Duration,
}

impl<'a, S: SegmentStore> UplinkPublisher<'a, S> {
    pub fn new(
        selector: &'a TransportSelector<'a>,
        queue: &'a dyn RetryQueueStore,
        mqtt: &'a dyn Publisher,
        downlink: &'a DownlinkProtocol<S>,
        handler: &'a dyn CommandHandler,
        identity: SensorIdentity,
        topic_prefix: impl Into<String>,
    ) -> Self {
        Self {
            selector,
            queue,
            mqtt,
            downlink,
            handler,
            identity,
            topic_prefix: topic_prefix.into(),
            drain_owner: format!("pid-{}", std::process::id()),
            drain_lease_ttl: DRAIN_LEASE_TTL,
        }
    }

    pub fn with_drain_lease_ttl(mut self, ttl: Duration) -> Self {
        self.drain_lease_ttl = ttl;
        self
    }

    fn hold_drain_lease(&self) -> Result<bool> {
        self.queue
            .try_acquire_drain_lease(&self.drain_owner, self.drain_lease_ttl)
    }

    /// Runs one reporting cycle for `measurement`.
    ///
    /// Only store failures are returned as errors; transport trouble is
    /// reported through [`CycleOutcome::Queued`].
    pub async fn publish_cycle(&self, measurement: Measurement) -> Result<CycleOutcome> {
        match self.selector.active_transport()? {
            Some(Transport::Wifi) => self.publish_wifi(measurement).await,
            Some(Transport::Lora) => self.send_lora(measurement).await,
            None => {
                warn!(
                    timestamp = measurement.timestamp,
                    count = measurement.count,
                    "No transport available, storing measurement"
                );
                self.park(measurement, UplinkError::TransportUnavailable)
            }
        }
    }

    fn park(&self, measurement: Measurement, reason: UplinkError) -> Result<CycleOutcome> {
        self.queue.enqueue(&measurement)?;
        Ok(CycleOutcome::Queued { reason })
    }

    async fn publish_measurement(&self, measurement: &Measurement) -> Result<()> {
        let topic = detections_topic(&self.topic_prefix, &self.identity);
        let payload = serde_json::to_vec(&DetectionPayload::from(measurement))?;
        self.mqtt.publish(&topic, &payload).await
    }

    async fn publish_wifi(&self, measurement: Measurement) -> Result<CycleOutcome> {
        match self.publish_measurement(&measurement).await {
            Ok(()) => {
                info!(
                    timestamp = measurement.timestamp,
                    count = measurement.count,
                    "Measurement published"
                );
                let drained = self.drain().await?;
                Ok(CycleOutcome::Delivered { drained })
            }
            Err(e) => {
                warn!(error = %e, "Publish failed, storing measurement");
                self.park(measurement, e)
            }
        }
    }

    /// Delivers queued measurements oldest first until the queue is empty or
    /// a publish fails. The failed entry stays at the head.
    ///
    /// The drain lease is renewed before each publish and the drain stops as
    /// soon as another process holds it.
    pub async fn drain(&self) -> Result<usize> {
        if !self.hold_drain_lease()? {
            info!("Another process is draining the retry queue");
            return Ok(0);
        }

        let result = self.drain_locked().await;
        self.queue.release_drain_lease(&self.drain_owner)?;
        result
    }

    async fn drain_locked(&self) -> Result<usize> {
        let mut drained = 0;
        loop {
            if !self.hold_drain_lease()? {
                warn!(drained, "Drain lease taken over, stopping drain");
                break;
            }
            let Some(entry) = self.queue.peek_oldest()? else {
                break;
            };
            if let Err(e) = self.publish_measurement(&entry.measurement).await {
                warn!(
                    id = entry.id,
                    error = %e,
                    "Pending measurement not delivered, stopping drain"
                );
                break;
            }
            self.queue.remove(entry.id)?;
            drained += 1;
        }
        if drained > 0 {
            info!(drained, "Pending measurements delivered");
        }
        Ok(drained)
    }

    async fn send_lora(&self, measurement: Measurement) -> Result<CycleOutcome> {
        let payload = format!(
            "{},{},{}",
            measurement.count, self.identity.bucket, self.identity.name
        );

        let failure = match self.selector.probe().modem.send(&payload).await {
            Ok(ModemResponse::Sent { downlink }) => {
                info!(count = measurement.count, "Measurement sent over LoRa");
                let command = match downlink {
                    Some(hex) => self.handle_downlink(&hex).await,
                    None => None,
                };
                return Ok(CycleOutcome::SentOverLora { command });
            }
            Ok(ModemResponse::Timeout) => {
                UplinkError::ModemTimeout("no network reply to uplink".to_string())
            }
            Ok(ModemResponse::Error(msg)) => UplinkError::ModemError(msg),
            Err(e) => e,
        };

        warn!(error = %failure, "LoRa send failed, storing measurement");
        let outcome = self.park(measurement, failure)?;

        if !self.selector.probe().probe_lora_connection().await? {
            warn!("LoRa network session lost");
            self.selector.reestablish_lora().await?;
        }
        Ok(outcome)
    }

    async fn handle_downlink(&self, hex: &str) -> Option<Command> {
        match self.downlink.handle(hex, self.handler).await {
            Ok(command) => command,
            Err(e @ UplinkError::Protocol(_)) => {
                warn!(error = %e, "Dropping malformed downlink");
                None
            }
            Err(e) => {
                error!(error = %e, "Downlink could not be applied");
                None
            }
        }
    }

    /// Publishes the sensor's coordinates. Only sent over Wi-Fi and never
    /// queued.
    pub async fn publish_location(&self, latitude: f64, longitude: f64) -> Result<()> {
        if self.selector.active_transport()? != Some(Transport::Wifi) {
            return Err(UplinkError::TransportUnavailable);
        }
        let topic = location_topic(&self.topic_prefix, &self.identity);
        let payload = serde_json::to_vec(&LocationPayload {
            latitude,
            longitude,
        })?;
        self.mqtt.publish(&topic, &payload).await?;
        info!(latitude, longitude, "Location published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downlink::tests::RecordingHandler;
    use crate::downlink::MemorySegments;
    use crate::modem::tests::FakeModem;
    use crate::net::tests::FakePublisher;
    use crate::probe::TransportProbe;
    use crate::storage::{SqliteStore, TransportStateStore};
    use crate::wifi::tests::FakeWifi;
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    const UUID: &str = "202481587074134";

    struct Rig {
        store: SqliteStore,
        wifi: FakeWifi,
        modem: FakeModem,
        mqtt: FakePublisher,
        downlink: DownlinkProtocol<MemorySegments>,
        handler: RecordingHandler,
    }

    impl Rig {
        fn new(mqtt: FakePublisher) -> Self {
            Self {
                store: SqliteStore::open_in_memory().unwrap(),
                wifi: FakeWifi::default(),
                modem: FakeModem::default(),
                mqtt,
                downlink: DownlinkProtocol::new(MemorySegments::new(), UUID),
                handler: RecordingHandler::default(),
            }
        }

        fn wifi_up(self) -> Self {
            self.store.set_wifi_available(true).unwrap();
            self.store.set_wifi_connected(true).unwrap();
            self
        }

        fn lora_up(self) -> Self {
            self.store.set_lora_available(true).unwrap();
            self.store.set_lora_connected(true).unwrap();
            self
        }

        /// Empties the queue, oldest first.
        fn take_pending(&self) -> Vec<Measurement> {
            std::iter::from_fn(|| {
                let entry = self.store.peek_oldest().unwrap()?;
                self.store.remove(entry.id).unwrap();
                Some(entry.measurement)
            })
            .collect()
        }
    }

    fn identity() -> SensorIdentity {
        SensorIdentity {
            uuid: UUID.into(),
            name: "lobby".into(),
            bucket: "campus".into(),
            ip_address: "192.168.1.23".into(),
        }
    }

    fn delivered_timestamps(mqtt: &FakePublisher) -> Vec<i64> {
        mqtt.delivered_payloads()
            .iter()
            .map(|p| serde_json::from_str::<DetectionPayload>(p).unwrap().timestamp)
            .collect()
    }

    async fn cycle(rig: &Rig, m: Measurement) -> CycleOutcome {
        let selector =
            TransportSelector::new(TransportProbe::new(&rig.store, &rig.wifi, &rig.modem, "wlan0"));
        let publisher = UplinkPublisher::new(
            &selector,
            &rig.store,
            &rig.mqtt,
            &rig.downlink,
            &rig.handler,
            identity(),
            "prefix",
        );
        publisher.publish_cycle(m).await.unwrap()
    }

    #[tokio::test]
    async fn test_no_transport_enqueues_without_attempt() {
        let rig = Rig::new(FakePublisher::default());
        let outcome = cycle(&rig, Measurement::new(1, 4)).await;

        assert!(matches!(
            outcome,
            CycleOutcome::Queued {
                reason: UplinkError::TransportUnavailable
            }
        ));
        assert_eq!(*rig.mqtt.attempts.lock().unwrap(), 0);
        assert!(rig.modem.sent().is_empty());
        assert_eq!(rig.take_pending(), vec![Measurement::new(1, 4)]);
    }

    #[tokio::test]
    async fn test_wifi_failure_does_not_drain() {
        let rig = Rig::new(FakePublisher::script(&[false])).wifi_up();
        rig.store.enqueue(&Measurement::new(1, 1)).unwrap();

        let outcome = cycle(&rig, Measurement::new(2, 2)).await;
        assert!(!outcome.is_delivered());
        assert_eq!(*rig.mqtt.attempts.lock().unwrap(), 1);
        assert_eq!(rig.take_pending(), vec![Measurement::new(1, 1), Measurement::new(2, 2)]);
    }

    #[tokio::test]
    async fn test_outage_backlog_is_delivered_in_order_after_recovery() {
        let rig = Rig::new(FakePublisher::script(&[false, false, false])).wifi_up();
        for t in 1..=3 {
            let outcome = cycle(&rig, Measurement::new(t, 10 + t as u64)).await;
            assert!(!outcome.is_delivered());
        }
        assert_eq!(rig.store.pending_count().unwrap(), 3);

        let outcome = cycle(&rig, Measurement::new(4, 14)).await;
        assert!(matches!(outcome, CycleOutcome::Delivered { drained: 3 }));
        assert_eq!(rig.store.pending_count().unwrap(), 0);

        assert_eq!(delivered_timestamps(&rig.mqtt), vec![4, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_failure_and_keeps_head() {
        let rig = Rig::new(FakePublisher::script(&[true, true, false])).wifi_up();
        for t in 1..=3 {
            rig.store.enqueue(&Measurement::new(t, t as u64)).unwrap();
        }

        let outcome = cycle(&rig, Measurement::new(10, 10)).await;
        assert!(matches!(outcome, CycleOutcome::Delivered { drained: 1 }));
        assert_eq!(
            rig.mqtt.delivered_payloads(),
            vec![
                r#"{"timestamp":10,"devices_detected":10}"#,
                r#"{"timestamp":1,"devices_detected":1}"#,
            ]
        );
        assert_eq!(rig.take_pending(), vec![Measurement::new(2, 2), Measurement::new(3, 3)]);
    }

    #[tokio::test]
    async fn test_lora_send_uses_compact_payload() {
        let rig = Rig::new(FakePublisher::default()).lora_up();
        let outcome = cycle(&rig, Measurement::new(5, 17)).await;

        assert!(matches!(outcome, CycleOutcome::SentOverLora { command: None }));
        assert_eq!(rig.modem.sent(), vec!["17,campus,lobby"]);
        assert_eq!(*rig.mqtt.attempts.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lora_downlink_is_dispatched() {
        let rig = Rig::new(FakePublisher::default()).lora_up();
        rig.modem.reply(Ok(ModemResponse::Sent {
            downlink: Some(hex::encode("c,1,1,window=10")),
        }));

        let outcome = cycle(&rig, Measurement::new(5, 17)).await;
        assert!(matches!(
            outcome,
            CycleOutcome::SentOverLora {
                command: Some(Command::UpdateConfig(ref body))
            } if body == "window=10"
        ));
        assert_eq!(rig.handler.calls(), vec!["config:window=10"]);
    }

    #[tokio::test]
    async fn test_malformed_downlink_is_dropped() {
        let rig = Rig::new(FakePublisher::default()).lora_up();
        rig.modem.reply(Ok(ModemResponse::Sent {
            downlink: Some(hex::encode("c,abc,1,X")),
        }));

        let outcome = cycle(&rig, Measurement::new(5, 17)).await;
        assert!(matches!(outcome, CycleOutcome::SentOverLora { command: None }));
        assert!(rig.handler.calls().is_empty());
    }

    #[tokio::test]
    async fn test_lora_timeout_rejoins_when_session_lost() {
        let rig = Rig::new(FakePublisher::default()).lora_up();
        rig.modem.reply(Ok(ModemResponse::Timeout));
        rig.modem.reply(Ok(ModemResponse::Error("error 86".into())));
        *rig.modem.join_ok.lock().unwrap() = true;

        let outcome = cycle(&rig, Measurement::new(5, 17)).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Queued {
                reason: UplinkError::ModemTimeout(_)
            }
        ));
        assert_eq!(rig.modem.sent(), vec!["17,campus,lobby", "%"]);
        assert_eq!(*rig.modem.joins.lock().unwrap(), 1);
        assert!(rig.store.load_state().unwrap().lora_connected);
        assert_eq!(rig.take_pending(), vec![Measurement::new(5, 17)]);
    }

    #[tokio::test]
    async fn test_lora_error_with_live_session_skips_rejoin() {
        let rig = Rig::new(FakePublisher::default()).lora_up();
        rig.modem.reply(Ok(ModemResponse::Error("error 5".into())));

        cycle(&rig, Measurement::new(5, 17)).await;
        assert_eq!(*rig.modem.joins.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_skipped_while_other_process_holds_lease() {
        let rig = Rig::new(FakePublisher::default()).wifi_up();
        rig.store.enqueue(&Measurement::new(1, 1)).unwrap();
        assert!(rig
            .store
            .try_acquire_drain_lease("other", Duration::from_secs(60))
            .unwrap());

        let outcome = cycle(&rig, Measurement::new(2, 2)).await;
        assert!(matches!(outcome, CycleOutcome::Delivered { drained: 0 }));
        assert_eq!(rig.take_pending(), vec![Measurement::new(1, 1)]);
    }

    #[tokio::test]
    async fn test_location_only_over_wifi() {
        let rig = Rig::new(FakePublisher::default()).lora_up();
        let selector =
            TransportSelector::new(TransportProbe::new(&rig.store, &rig.wifi, &rig.modem, "wlan0"));
        let publisher = UplinkPublisher::new(
            &selector,
            &rig.store,
            &rig.mqtt,
            &rig.downlink,
            &rig.handler,
            identity(),
            "prefix",
        );
        assert!(matches!(
            publisher.publish_location(38.7, -9.1).await,
            Err(UplinkError::TransportUnavailable)
        ));

        rig.store.set_wifi_available(true).unwrap();
        rig.store.set_wifi_connected(true).unwrap();
        publisher.publish_location(38.7, -9.1).await.unwrap();
        assert_eq!(
            rig.mqtt.delivered.lock().unwrap()[0],
            (
                "prefix/sensorLocation/campus/192.168.1.23/lobby/202481587074134".to_string(),
                r#"{"latitude":38.7,"longitude":-9.1}"#.to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_unconfirmed_lora_send_is_queued() {
        let rig = Rig::new(FakePublisher::default()).lora_up();
        rig.modem.reply(Ok(ModemResponse::parse("Sending...\n")));

        let outcome = cycle(&rig, Measurement::new(5, 17)).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Queued {
                reason: UplinkError::ModemError(_)
            }
        ));
        assert_eq!(rig.take_pending(), vec![Measurement::new(5, 17)]);
    }

    /// Acknowledges every publish and hands the drain lease to another owner
    /// during publish number `take_on`.
    struct LeaseTakeover<'s> {
        store: &'s SqliteStore,
        take_on: u32,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Publisher for LeaseTakeover<'_> {
        async fn publish(&self, _topic: &str, _payload: &[u8]) -> Result<()> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call == self.take_on {
                assert!(self
                    .store
                    .try_acquire_drain_lease("other", Duration::from_secs(60))
                    .unwrap());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_drain_stops_when_lease_is_taken_over() {
        let rig = Rig::new(FakePublisher::default()).wifi_up();
        for t in 1..=5 {
            rig.store.enqueue(&Measurement::new(t, t as u64)).unwrap();
        }
        let mqtt = LeaseTakeover {
            store: &rig.store,
            take_on: 3,
            calls: Mutex::new(0),
        };
        let selector =
            TransportSelector::new(TransportProbe::new(&rig.store, &rig.wifi, &rig.modem, "wlan0"));
        let publisher = UplinkPublisher::new(
            &selector,
            &rig.store,
            &mqtt,
            &rig.downlink,
            &rig.handler,
            identity(),
            "prefix",
        )
        .with_drain_lease_ttl(Duration::ZERO);

        let outcome = publisher.publish_cycle(Measurement::new(10, 10)).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Delivered { drained: 2 }));
        assert_eq!(*mqtt.calls.lock().unwrap(), 3);
        assert!(!rig
            .store
            .try_acquire_drain_lease("third", Duration::from_secs(60))
            .unwrap());
        assert_eq!(
            rig.take_pending(),
            vec![Measurement::new(3, 3), Measurement::new(4, 4), Measurement::new(5, 5)]
        );
    }

    #[tokio::test]
    async fn test_random_outcomes_never_both_deliver_and_queue() {
        const CYCLES: i64 = 200;
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let script: Vec<bool> = (0..600).map(|_| rng.gen_bool(0.6)).collect();
        let rig = Rig::new(FakePublisher::script(&script)).wifi_up();

        for t in 1..=CYCLES {
            let outcome = cycle(&rig, Measurement::new(t, t as u64)).await;
            let delivered = delivered_timestamps(&rig.mqtt);
            assert_eq!(
                delivered.len() as u64 + rig.store.pending_count().unwrap(),
                t as u64,
                "cycle {t}"
            );
            assert_eq!(outcome.is_delivered(), delivered.contains(&t), "cycle {t}");
        }

        let delivered = delivered_timestamps(&rig.mqtt);
        let delivered_set: BTreeSet<i64> = delivered.iter().copied().collect();
        assert_eq!(delivered_set.len(), delivered.len());

        let queued: BTreeSet<i64> = rig.take_pending().iter().map(|m| m.timestamp).collect();
        assert!(delivered_set.is_disjoint(&queued));
        let all: BTreeSet<i64> = delivered_set.union(&queued).copied().collect();
        assert_eq!(all, (1..=CYCLES).collect::<BTreeSet<i64>>());
    }
}
