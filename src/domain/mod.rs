//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! transport implementations or broker client libraries.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod transport;

pub use transport::{
    //
    AckToken,
    Address,
    Delivery,
    Envelope,
    SubscribeOptions,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};
