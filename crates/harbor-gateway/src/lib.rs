// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod gateway;
mod http;
mod ws;

pub use gateway::{build_state, handle_inbound, run, GatewayState};
pub use http::router;
