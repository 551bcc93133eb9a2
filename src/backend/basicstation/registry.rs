//! Gateway connection registry.
//!
//! Maps EUI-64 to the gateway's connection handle under a reader-writer
//! lock. Lookups happen on every inbound message and every outbound
//! downlink; mutations only on connect/disconnect. At most one live
//! connection may exist per EUI: a second accept for an already-connected
//! EUI is rejected without disturbing the incumbent.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::backend::{Subscribe, SubscribeCallback};
use crate::lorawan::Eui64;

use super::{BackendError, GatewayConn};

struct Gateway {
    conn: Option<GatewayConn>,
}

#[derive(Default)]
pub(crate) struct Registry {
    gateways: RwLock<HashMap<Eui64, Gateway>>,
    subscribe_callback: RwLock<Option<SubscribeCallback>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn set_subscribe_callback(&self, cb: SubscribeCallback) {
        *self.subscribe_callback.write() = Some(cb);
    }

    /// Connection handle for the gateway, or an error when the gateway is
    /// unknown or currently has no packet forwarder attached.
    pub fn connection(&self, gateway_id: Eui64) -> Result<GatewayConn, BackendError> {
        let gateways = self.gateways.read();
        let gw = gateways
            .get(&gateway_id)
            .ok_or(BackendError::GatewayNotFound(gateway_id))?;
        gw.conn
            .clone()
            .ok_or(BackendError::GatewayNotConnected(gateway_id))
    }

    /// Register a connection (or, with `None`, a placeholder entry so the
    /// single-mode stats loop has a key). Fails without overwriting when
    /// the existing entry already carries a live connection.
    pub fn set(&self, gateway_id: Eui64, conn: Option<GatewayConn>) -> Result<(), BackendError> {
        {
            let mut gateways = self.gateways.write();
            if let Some(existing) = gateways.get(&gateway_id) {
                if existing.conn.is_some() {
                    return Err(BackendError::GatewayAlreadyConnected(gateway_id));
                }
            }
            gateways.insert(gateway_id, Gateway { conn });
        }

        self.emit_subscribe(Subscribe {
            subscribe: true,
            gateway_id,
        });
        Ok(())
    }

    /// Drop the entry entirely (normal disconnect).
    pub fn remove(&self, gateway_id: Eui64) {
        let removed = self.gateways.write().remove(&gateway_id).is_some();
        if removed {
            self.emit_subscribe(Subscribe {
                subscribe: false,
                gateway_id,
            });
        }
    }

    /// Keep the key but null the connection (single-mode disconnect; the
    /// stats loop keeps running against the placeholder).
    pub fn reset(&self, gateway_id: Eui64) {
        let mut gateways = self.gateways.write();
        if let Some(gw) = gateways.get_mut(&gateway_id) {
            gw.conn = None;
        }
    }

    fn emit_subscribe(&self, event: Subscribe) {
        let cb = self.subscribe_callback.read().clone();
        if let Some(cb) = cb {
            cb(event);
        }
    }
}
