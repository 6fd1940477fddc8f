// Runtime-adjustable protocol debugging.
//
// Categories gate extra `tracing` output per concern. Settings live behind an
// `ArcSwap` so they can be changed while connections are running without
// taking locks on the hot path.

use crate::ber::{hex_preview, Element};
use crate::error::LdapError;
use crate::message::LdapMessage;
use crate::protocol::operation_name;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

const HEX_PREVIEW_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugCategory {
    /// Raw elements read and written.
    Asn1,
    /// Connection establishment and teardown.
    Connect,
    /// Protocol messages sent and received.
    Ldap,
    ConnectionPool,
    /// Errors surfaced to callers.
    Exception,
    /// Endpoint selection and unsolicited notifications.
    Other,
}

impl DebugCategory {
    pub const ALL: [DebugCategory; 6] = [
        DebugCategory::Asn1,
        DebugCategory::Connect,
        DebugCategory::Ldap,
        DebugCategory::ConnectionPool,
        DebugCategory::Exception,
        DebugCategory::Other,
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugSettings {
    pub enabled: bool,
    pub categories: HashSet<DebugCategory>,
    /// Include a hex preview of encoded bytes in ASN.1 output.
    pub include_hex: bool,
}

impl DebugSettings {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            enabled: true,
            categories: DebugCategory::ALL.into_iter().collect(),
            include_hex: true,
        }
    }

    pub fn with_categories(categories: impl IntoIterator<Item = DebugCategory>) -> Self {
        Self {
            enabled: true,
            categories: categories.into_iter().collect(),
            include_hex: false,
        }
    }

    pub fn is_enabled(&self, category: DebugCategory) -> bool {
        self.enabled && self.categories.contains(&category)
    }
}

/// Shared, swappable debug settings.
#[derive(Debug, Clone)]
pub struct DebugHandle(Arc<ArcSwap<DebugSettings>>);

impl Default for DebugHandle {
    fn default() -> Self {
        Self::new(DebugSettings::disabled())
    }
}

impl DebugHandle {
    pub fn new(settings: DebugSettings) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(settings)))
    }

    /// Replace the settings; takes effect for every holder of this handle.
    pub fn update(&self, settings: DebugSettings) {
        self.0.store(Arc::new(settings));
    }

    pub fn settings(&self) -> Arc<DebugSettings> {
        self.0.load_full()
    }

    pub fn is_enabled(&self, category: DebugCategory) -> bool {
        self.0.load().is_enabled(category)
    }

    pub fn connect(&self, endpoint: &str, event: &str) {
        if self.is_enabled(DebugCategory::Connect) {
            debug!(target: "ldap_client_core::debug::connect", endpoint, "{}", event);
        }
    }

    pub fn message_sent(&self, endpoint: &str, message: &LdapMessage) {
        if self.is_enabled(DebugCategory::Ldap) {
            debug!(
                target: "ldap_client_core::debug::ldap",
                endpoint,
                message_id = message.message_id,
                op = operation_name(message.op_tag()),
                controls = message.controls.len(),
                "sending request"
            );
        }
    }

    pub fn message_received(&self, endpoint: &str, message: &LdapMessage) {
        if self.is_enabled(DebugCategory::Ldap) {
            debug!(
                target: "ldap_client_core::debug::ldap",
                endpoint,
                message_id = message.message_id,
                tag = %message.op_tag(),
                op = operation_name(message.op_tag()),
                "received response"
            );
        }
    }

    pub fn asn1(&self, endpoint: &str, direction: &str, element: &Element) {
        let settings = self.0.load();
        if !settings.is_enabled(DebugCategory::Asn1) {
            return;
        }
        if settings.include_hex {
            let bytes = element.encode();
            debug!(
                target: "ldap_client_core::debug::asn1",
                endpoint,
                direction,
                len = bytes.len(),
                hex = %hex_preview(&bytes, HEX_PREVIEW_BYTES),
                "{:?}", element
            );
        } else {
            debug!(target: "ldap_client_core::debug::asn1", endpoint, direction, "{:?}", element);
        }
    }

    pub fn pool(&self, pool: &str, event: &str) {
        if self.is_enabled(DebugCategory::ConnectionPool) {
            debug!(target: "ldap_client_core::debug::pool", pool, "{}", event);
        }
    }

    pub fn exception(&self, endpoint: &str, error: &LdapError) {
        if self.is_enabled(DebugCategory::Exception) {
            debug!(target: "ldap_client_core::debug::exception", endpoint, scope = ?error.scope(), "{}", error);
        }
    }

    /// Anything outside the other categories: endpoint selection, unsolicited
    /// notifications.
    pub fn other(&self, endpoint: &str, event: &str) {
        if self.is_enabled(DebugCategory::Other) {
            debug!(target: "ldap_client_core::debug::other", endpoint, "{}", event);
        }
    }
}
