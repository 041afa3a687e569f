//! JSON control channel.
//!
//! Embedders that keep the engine in a separate process expose the consumer
//! control surface over a unix socket: one JSON request object per message,
//! one JSON response back. The wire format is the tagged [`ControlRequest`]
//! enum; in-process embedders can skip the socket and call [`apply`]
//! directly.

use std::io::{BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::filter::RegexSetFilter;
use crate::group::GroupPolicy;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Enable {
        id: usize,
    },
    Disable {
        id: usize,
    },
    SetCaplen {
        id: usize,
        caplen: usize,
    },
    SetSlots {
        id: usize,
        slots: usize,
    },
    SetOffset {
        id: usize,
        offset: usize,
    },
    SetTimestamp {
        id: usize,
        on: bool,
    },
    JoinGroup {
        id: usize,
        #[serde(default)]
        gid: Option<usize>,
        class_mask: u32,
        policy: GroupPolicy,
    },
    LeaveGroup {
        id: usize,
        gid: usize,
    },
    Bind {
        id: usize,
        gid: usize,
        #[serde(default)]
        if_index: Option<u32>,
        #[serde(default)]
        hw_queue: Option<u8>,
    },
    Unbind {
        id: usize,
        gid: usize,
        #[serde(default)]
        if_index: Option<u32>,
        #[serde(default)]
        hw_queue: Option<u8>,
    },
    SetClassifier {
        id: usize,
        gid: usize,
        level: usize,
        name: String,
        #[serde(default)]
        context: Option<Vec<u8>>,
    },
    SetFilter {
        id: usize,
        gid: usize,
        patterns: Vec<String>,
    },
    ClearFilter {
        id: usize,
        gid: usize,
    },
    ResetGroup {
        id: usize,
        gid: usize,
    },
    SetVlanFilterEnabled {
        id: usize,
        gid: usize,
        enabled: bool,
    },
    SetVlanFilter {
        id: usize,
        gid: usize,
        vid: i32,
        on: bool,
    },
    GetStats {
        id: usize,
    },
    GetGroupStats {
        id: usize,
        gid: usize,
    },
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Joined { gid: usize },
    Stats { recv: u64, lost: u64, drop: u64 },
    Error { message: String },
}

/// Executes one control request against the engine.
pub fn apply(engine: &Engine, req: ControlRequest) -> ControlResponse {
    use ControlRequest::*;
    let result = match req {
        Enable { id } => engine.enable(id),
        Disable { id } => engine.disable(id),
        SetCaplen { id, caplen } => engine.set_caplen(id, caplen),
        SetSlots { id, slots } => engine.set_slots(id, slots),
        SetOffset { id, offset } => engine.set_offset(id, offset),
        SetTimestamp { id, on } => engine.set_tstamp(id, on),
        JoinGroup {
            id,
            gid,
            class_mask,
            policy,
        } => {
            return match engine.join_group(id, gid, class_mask, policy) {
                Ok(gid) => ControlResponse::Joined { gid },
                Err(e) => error(e),
            }
        }
        LeaveGroup { id, gid } => engine.leave_group(id, gid),
        Bind {
            id,
            gid,
            if_index,
            hw_queue,
        } => engine.bind(id, gid, if_index, hw_queue),
        Unbind {
            id,
            gid,
            if_index,
            hw_queue,
        } => engine.unbind(id, gid, if_index, hw_queue),
        SetClassifier {
            id,
            gid,
            level,
            name,
            context,
        } => engine.set_classifier(id, gid, level, &name, context.as_deref()),
        SetFilter { id, gid, patterns } => match RegexSetFilter::new(&patterns) {
            Ok(filter) => engine.set_filter(id, gid, Some(Arc::new(filter))),
            Err(e) => {
                return ControlResponse::Error {
                    message: e.to_string(),
                }
            }
        },
        ClearFilter { id, gid } => engine.set_filter(id, gid, None),
        ResetGroup { id, gid } => engine.reset_group(id, gid),
        SetVlanFilterEnabled { id, gid, enabled } => {
            engine.set_vlan_filter_enabled(id, gid, enabled)
        }
        SetVlanFilter { id, gid, vid, on } => engine.set_vlan_filter(id, gid, vid, on),
        GetStats { id } => {
            return match engine.stats(id) {
                Ok(s) => stats(s),
                Err(e) => error(e),
            }
        }
        GetGroupStats { id, gid } => {
            return match engine.group_stats(id, gid) {
                Ok(s) => stats(s),
                Err(e) => error(e),
            }
        }
    };
    match result {
        Ok(()) => ControlResponse::Ok,
        Err(e) => error(e),
    }
}

fn stats(s: crate::stats::Stats) -> ControlResponse {
    ControlResponse::Stats {
        recv: s.recv,
        lost: s.lost,
        drop: s.drop,
    }
}

fn error(e: crate::error::Error) -> ControlResponse {
    ControlResponse::Error {
        message: e.to_string(),
    }
}

/// Accepts control connections on a unix socket, one thread per client.
pub struct ControlServer {
    listener: UnixListener,
    engine: Arc<Engine>,
}

impl ControlServer {
    pub fn bind<P: AsRef<Path>>(path: P, engine: Arc<Engine>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind control socket {}", path.display()))?;
        log::info!("control channel listening on {}", path.display());
        Ok(ControlServer { listener, engine })
    }

    pub fn run(self) -> anyhow::Result<()> {
        for stream in self.listener.incoming() {
            let stream = stream.context("control accept failed")?;
            let engine = self.engine.clone();
            thread::spawn(move || {
                if let Err(e) = handle_connection(&engine, stream) {
                    log::warn!("control connection ended: {e}");
                }
            });
        }
        Ok(())
    }
}

fn handle_connection(engine: &Engine, stream: UnixStream) -> anyhow::Result<()> {
    let mut writer = stream.try_clone().context("failed to clone control stream")?;
    let reader = BufReader::new(stream);
    for req in serde_json::Deserializer::from_reader(reader).into_iter::<ControlRequest>() {
        let resp = match req {
            Ok(req) => {
                log::debug!("control request: {req:?}");
                apply(engine, req)
            }
            Err(e) => ControlResponse::Error {
                message: format!("malformed request: {e}"),
            },
        };
        serde_json::to_writer(&mut writer, &resp)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn engine() -> Arc<Engine> {
        Engine::new(EngineConfig::default()).unwrap()
    }

    fn req(json: &str) -> ControlRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn join_and_stats_over_json() {
        let e = engine();
        let _c = e.create_consumer().unwrap();

        let resp = apply(
            &e,
            req(r#"{"op":"join_group","id":0,"class_mask":1,"policy":"shared"}"#),
        );
        assert_eq!(resp, ControlResponse::Joined { gid: 0 });

        let resp = apply(&e, req(r#"{"op":"get_stats","id":0}"#));
        assert_eq!(
            resp,
            ControlResponse::Stats {
                recv: 0,
                lost: 0,
                drop: 0
            }
        );
    }

    #[test]
    fn errors_become_responses() {
        let e = engine();
        let resp = apply(&e, req(r#"{"op":"enable","id":7}"#));
        assert!(matches!(resp, ControlResponse::Error { .. }));
    }

    #[test]
    fn filter_patterns_are_validated() {
        let e = engine();
        let _c = e.create_consumer().unwrap();
        apply(
            &e,
            req(r#"{"op":"join_group","id":0,"gid":2,"class_mask":1,"policy":"private"}"#),
        );
        let resp = apply(
            &e,
            req(r#"{"op":"set_filter","id":0,"gid":2,"patterns":["[broken"]}"#),
        );
        assert!(matches!(resp, ControlResponse::Error { .. }));
        let resp = apply(
            &e,
            req(r#"{"op":"set_filter","id":0,"gid":2,"patterns":["^abc"]}"#),
        );
        assert_eq!(resp, ControlResponse::Ok);
    }

    #[test]
    fn classifier_ops_over_json() {
        let e = engine();
        let _c = e.create_consumer().unwrap();
        apply(
            &e,
            req(r#"{"op":"join_group","id":0,"gid":0,"class_mask":1,"policy":"private"}"#),
        );
        let resp = apply(
            &e,
            req(r#"{"op":"set_classifier","id":0,"gid":0,"level":0,"name":"steer-rss"}"#),
        );
        assert_eq!(resp, ControlResponse::Ok);
        let resp = apply(
            &e,
            req(r#"{"op":"set_classifier","id":0,"gid":0,"level":0,"name":"bogus"}"#),
        );
        assert!(matches!(resp, ControlResponse::Error { .. }));
    }

    #[test]
    fn responses_serialize_with_a_status_tag() {
        let json = serde_json::to_string(&ControlResponse::Joined { gid: 3 }).unwrap();
        assert_eq!(json, r#"{"status":"joined","gid":3}"#);
        let json = serde_json::to_string(&ControlResponse::Ok).unwrap();
        assert_eq!(json, r#"{"status":"ok"}"#);
    }
}
