//! Port catalog and destination selection.

use super::{Address, Sequencer};
use bitflags::bitflags;

bitflags! {
    /// What a port allows other clients to do with it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capability: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const SYNC_READ = 1 << 2;
        const SYNC_WRITE = 1 << 3;
        const DUPLEX = 1 << 4;
        const SUBS_READ = 1 << 5;
        const SUBS_WRITE = 1 << 6;
        const NO_EXPORT = 1 << 7;
    }
}

bitflags! {
    /// What kind of endpoint a port is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PortType: u32 {
        const SPECIFIC = 1 << 0;
        const MIDI_GENERIC = 1 << 1;
        const MIDI_GM = 1 << 2;
        const HARDWARE = 1 << 16;
        const SOFTWARE = 1 << 17;
        const SYNTHESIZER = 1 << 18;
        const PORT = 1 << 19;
        const APPLICATION = 1 << 20;
    }
}

/// A port as advertised by the sequencing service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub addr: Address,
    pub client_name: String,
    pub name: String,
    pub capability: Capability,
    pub port_type: PortType,
}

impl PortInfo {
    /// True if events can be routed to this port by subscription.
    pub fn accepts_subscription(&self, required: PortType) -> bool {
        self.port_type.contains(required)
            && self
                .capability
                .contains(Capability::WRITE | Capability::SUBS_WRITE)
            && !self.capability.contains(Capability::NO_EXPORT)
    }
}

/// The outcome of destination selection.
///
/// Events are always addressed to `address`; `connected` names the port that
/// was subscribed to the source port, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub address: Address,
    pub connected: Option<Address>,
}

impl Default for Destination {
    fn default() -> Self {
        Self {
            address: Address::SUBSCRIBERS,
            connected: None,
        }
    }
}

/// Picks where playback events go and subscribes that port.
///
/// # Arguments
///
/// * `seq` - The sequencer whose source port gets connected
/// * `hint` - An explicit destination address, tried first
/// * `no_connect` - Leave the port unconnected; events only reach existing
///   subscribers
///
/// # Returns
///
/// The destination. Its address is always the subscribers broadcast; the
/// connected port is, in order of preference: the hinted port, the first
/// synthesizer, the first generic MIDI port, or none.
pub fn resolve_destination(
    seq: &mut dyn Sequencer,
    hint: Option<&str>,
    no_connect: bool,
) -> Destination {
    let mut dest = Destination::default();

    if no_connect {
        tracing::debug!("Auto-connect disabled, sending to subscribers only");
        return dest;
    }

    if let Some(hint) = hint.filter(|h| !h.trim().is_empty()) {
        match seq.parse_address(hint) {
            Some(addr) => match seq.connect_to(addr) {
                Ok(()) => {
                    tracing::info!("Connected to requested port {}", addr);
                    dest.connected = Some(addr);
                    return dest;
                }
                Err(e) => tracing::warn!("Requested port {} unavailable: {}", hint, e),
            },
            None => tracing::warn!("Cannot parse output port {:?}", hint),
        }
    }

    // Synthesizers are the primary use case, then any MIDI port
    for required in [PortType::MIDI_GENERIC | PortType::SYNTHESIZER, PortType::MIDI_GENERIC] {
        if let Some(addr) = connect_first_available(seq, required) {
            dest.connected = Some(addr);
            return dest;
        }
    }

    tracing::info!("No output port found, sending to subscribers");
    dest
}

fn connect_first_available(seq: &mut dyn Sequencer, required: PortType) -> Option<Address> {
    let own_client = seq.source().client;
    let mut ports = seq.ports();
    ports.sort_by_key(|p| p.addr);

    for port in ports {
        if port.addr.client == own_client || !port.accepts_subscription(required) {
            continue;
        }
        tracing::debug!(
            "Client {} Cap {:?} Type {:?}",
            port.addr.client,
            port.capability,
            port.port_type
        );
        match seq.connect_to(port.addr) {
            Ok(()) => {
                tracing::info!("Connected to {} ({})", port.addr, port.name);
                return Some(port.addr);
            }
            Err(e) => tracing::debug!("Skipping {}: {}", port.addr, e),
        }
    }
    None
}
