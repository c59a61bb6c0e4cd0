// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Communication internals shared by the channel and session layers - the frame codec
//! the core owns, and the secure channel cryptographic state.

pub mod message;
pub mod secure_channel;
