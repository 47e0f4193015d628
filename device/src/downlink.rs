//! LoRa downlink decoding, segment reassembly and command dispatch.
//!
//! A downlink arrives as hex text that decodes to UTF-8. Three single-word
//! payloads are control commands (`r`, `a`, `dis`). Everything else has the
//! header `type,totalSegments,currentSegment,` followed by data, where `type`
//! is one of `c`, `d`, `del` or `r`. Multi-segment bodies are buffered per
//! type until the final segment arrives.
//!
//! Each reporting cycle runs in its own process, so partial buffers live in a
//! [`SegmentStore`] rather than in memory.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, UplinkError};
use crate::types::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Config,
    Defaults,
    Delete,
    TargetedReboot,
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "c",
            Self::Defaults => "d",
            Self::Delete => "del",
            Self::TargetedReboot => "r",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "c" => Some(Self::Config),
            "d" => Some(Self::Defaults),
            "del" => Some(Self::Delete),
            "r" => Some(Self::TargetedReboot),
            _ => None,
        }
    }
}

/// Segments received so far for one command type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentBuffer {
    total: u32,
    received: Vec<String>,
}

impl SegmentBuffer {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            received: Vec::new(),
        }
    }

    pub fn from_parts(total: u32, received: Vec<String>) -> Self {
        Self { total, received }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn received(&self) -> &[String] {
        &self.received
    }

    /// Number of the segment expected next.
    pub fn next_segment(&self) -> u32 {
        u32::try_from(self.received.len()).map_or(u32::MAX, |n| n.saturating_add(1))
    }

    pub fn push(&mut self, data: &str) {
        self.received.push(data.to_string());
    }

    pub fn is_complete(&self) -> bool {
        self.next_segment() > self.total
    }

    pub fn body(&self) -> String {
        self.received.concat()
    }
}

/// Where partially received commands are kept between cycles.
pub trait SegmentStore {
    fn load_segments(&self, kind: SegmentKind) -> Result<Option<SegmentBuffer>>;
    fn save_segments(&self, kind: SegmentKind, buffer: &SegmentBuffer) -> Result<()>;
    fn clear_segments(&self, kind: SegmentKind) -> Result<()>;
}

impl<T: SegmentStore + ?Sized> SegmentStore for &T {
    fn load_segments(&self, kind: SegmentKind) -> Result<Option<SegmentBuffer>> {
        (**self).load_segments(kind)
    }

    fn save_segments(&self, kind: SegmentKind, buffer: &SegmentBuffer) -> Result<()> {
        (**self).save_segments(kind, buffer)
    }

    fn clear_segments(&self, kind: SegmentKind) -> Result<()> {
        (**self).clear_segments(kind)
    }
}

/// Process-local segment store.
#[derive(Debug, Default)]
pub struct MemorySegments {
    buffers: Mutex<HashMap<SegmentKind, SegmentBuffer>>,
}

impl MemorySegments {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffers(&self) -> Result<std::sync::MutexGuard<'_, HashMap<SegmentKind, SegmentBuffer>>> {
        self.buffers
            .lock()
            .map_err(|_| UplinkError::Storage("segment map poisoned".to_string()))
    }
}

impl SegmentStore for MemorySegments {
    fn load_segments(&self, kind: SegmentKind) -> Result<Option<SegmentBuffer>> {
        Ok(self.buffers()?.get(&kind).cloned())
    }

    fn save_segments(&self, kind: SegmentKind, buffer: &SegmentBuffer) -> Result<()> {
        self.buffers()?.insert(kind, buffer.clone());
        Ok(())
    }

    fn clear_segments(&self, kind: SegmentKind) -> Result<()> {
        self.buffers()?.remove(&kind);
        Ok(())
    }
}

/// Side effects a decoded command can trigger on the sensor.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn trigger_reboot(&self) -> Result<()>;
    async fn set_detection_enabled(&self, enabled: bool) -> Result<()>;
    async fn apply_config_delta(&self, body: &str) -> Result<()>;
    async fn apply_defaults_delta(&self, body: &str) -> Result<()>;
    async fn delete_local_config(&self) -> Result<()>;
}

/// One parsed downlink message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(Command),
    Segment {
        kind: SegmentKind,
        total: u32,
        current: u32,
        data: String,
    },
}

pub fn decode_hex_payload(hex_payload: &str) -> Result<String> {
    let bytes = hex::decode(hex_payload.trim())
        .map_err(|e| UplinkError::Protocol(format!("downlink is not hex: {e}")))?;
    String::from_utf8(bytes).map_err(|e| UplinkError::Protocol(format!("downlink is not UTF-8: {e}")))
}

pub fn parse_frame(text: &str) -> Result<Frame> {
    match text {
        "r" => return Ok(Frame::Control(Command::Reboot)),
        "a" => return Ok(Frame::Control(Command::Activate)),
        "dis" => return Ok(Frame::Control(Command::Disable)),
        _ => {}
    }

    let mut fields = text.splitn(4, ',');
    let tag = fields.next().unwrap_or_default();
    let kind = SegmentKind::from_tag(tag)
        .ok_or_else(|| UplinkError::Protocol(format!("unknown command type '{tag}'")))?;

    let total = fields
        .next()
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .filter(|&n| n > 0)
        .ok_or_else(|| UplinkError::Protocol(format!("invalid segment count in '{text}'")))?;

    let current_field = fields.next();
    let current = if total == 1 {
        1
    } else {
        current_field
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .filter(|n| (1..=total).contains(n))
            .ok_or_else(|| {
                UplinkError::Protocol(format!("invalid segment number in '{text}' (total {total})"))
            })?
    };

    Ok(Frame::Segment {
        kind,
        total,
        current,
        data: fields.next().unwrap_or_default().to_string(),
    })
}

/// Reassembles downlink segments and turns complete bodies into commands.
pub struct DownlinkProtocol<S> {
    segments: S,
    own_uuid: String,
}

impl<S: SegmentStore> DownlinkProtocol<S> {
    pub fn new(segments: S, own_uuid: impl Into<String>) -> Self {
        Self {
            segments,
            own_uuid: own_uuid.into(),
        }
    }

    pub fn segments(&self) -> &S {
        &self.segments
    }

    /// Feeds one decoded message. Returns a command once one is complete and
    /// addressed to this sensor.
    pub fn receive(&self, text: &str) -> Result<Option<Command>> {
        match parse_frame(text)? {
            Frame::Control(command) => Ok(Some(command)),
            Frame::Segment {
                kind,
                total: 1,
                data,
                ..
            } => Ok(self.build_command(kind, data)),
            Frame::Segment {
                kind,
                total,
                current,
                data,
            } => match self.reassemble(kind, total, current, &data)? {
                Some(body) => Ok(self.build_command(kind, body)),
                None => Ok(None),
            },
        }
    }

    fn reassemble(
        &self,
        kind: SegmentKind,
        total: u32,
        current: u32,
        data: &str,
    ) -> Result<Option<String>> {
        let mut buffer = if current == 1 {
            if let Some(stale) = self.segments.load_segments(kind)? {
                warn!(
                    kind = kind.as_str(),
                    received = stale.received().len(),
                    total = stale.total(),
                    "Discarding unfinished segment buffer"
                );
            }
            SegmentBuffer::new(total)
        } else {
            let buffer = self.segments.load_segments(kind)?.ok_or_else(|| {
                UplinkError::Protocol(format!(
                    "segment {current}/{total} for '{}' without a first segment",
                    kind.as_str()
                ))
            })?;
            if buffer.total() != total {
                return Err(UplinkError::Protocol(format!(
                    "segment count changed from {} to {total} mid-command",
                    buffer.total()
                )));
            }
            if buffer.next_segment() != current {
                return Err(UplinkError::Protocol(format!(
                    "expected segment {} but got {current}",
                    buffer.next_segment()
                )));
            }
            buffer
        };

        buffer.push(data);
        debug!(kind = kind.as_str(), current, total, "Downlink segment buffered");

        if buffer.is_complete() {
            self.segments.clear_segments(kind)?;
            Ok(Some(buffer.body()))
        } else {
            self.segments.save_segments(kind, &buffer)?;
            Ok(None)
        }
    }

    fn build_command(&self, kind: SegmentKind, body: String) -> Option<Command> {
        match kind {
            SegmentKind::Config => Some(Command::UpdateConfig(body)),
            SegmentKind::Defaults => Some(Command::UpdateDefaults(body)),
            SegmentKind::Delete | SegmentKind::TargetedReboot => {
                let target = body.split(',').next().unwrap_or_default().trim().to_string();
                if target.is_empty() || target != self.own_uuid {
                    info!(
                        kind = kind.as_str(),
                        target = %target,
                        "Downlink addressed to another sensor, ignoring"
                    );
                    return None;
                }
                Some(if kind == SegmentKind::Delete {
                    Command::DeleteConfig(target)
                } else {
                    Command::RebootTarget(target)
                })
            }
        }
    }

    /// Decodes a raw hex downlink and dispatches the resulting command, if any.
    pub async fn handle(
        &self,
        hex_payload: &str,
        handler: &dyn CommandHandler,
    ) -> Result<Option<Command>> {
        let text = decode_hex_payload(hex_payload)?;
        info!(payload = %text, "Downlink received");
        let command = self.receive(&text)?;
        if let Some(command) = &command {
            dispatch(command, handler).await?;
        }
        Ok(command)
    }
}

pub async fn dispatch(command: &Command, handler: &dyn CommandHandler) -> Result<()> {
    info!(?command, "Dispatching downlink command");
    match command {
        Command::Reboot | Command::RebootTarget(_) => handler.trigger_reboot().await,
        Command::Activate => handler.set_detection_enabled(true).await,
        Command::Disable => handler.set_detection_enabled(false).await,
        Command::UpdateConfig(body) => handler.apply_config_delta(body).await,
        Command::UpdateDefaults(body) => handler.apply_defaults_delta(body).await,
        Command::DeleteConfig(_) => handler.delete_local_config().await,
    }
}
