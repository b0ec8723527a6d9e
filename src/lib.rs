//! Zombiegram mesh node core.
//!
//! Firmware-side protocol stack for a battery-powered LoRa mesh of zombie
//! detectors. The crate covers the Zombiegram wire format (authenticated
//! header + opcode-typed payloads), the mesh router (dedup, acknowledgement,
//! probabilistic-threshold retransmission) and the gateway bridge that mirrors
//! verified traffic to external HTTP webhooks. Sensor drivers, the LoRa PHY
//! and the tamper-protection module are external collaborators reached
//! through the adapter seams in [`mesh`] and [`config_store`].

pub mod config_store;
pub mod dropqueue;
pub mod errors;
pub mod gateway;
pub mod ingress;
pub mod mesh;
pub mod retransmission;
pub mod router;
pub mod usms;
pub mod zombiegram;
