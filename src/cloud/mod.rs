//! Cloud REST client: login, device resolution and tunnel URL lookup.
//! The minimal slice of the cloud's REST surface this binary actually
//! needs.

mod client;

pub use client::CloudClient;
