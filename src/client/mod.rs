//! Client side of the reservation service.

pub mod volume_client;
