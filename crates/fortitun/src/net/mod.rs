// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket-layer building blocks: endpoints, the local listener, and the
//! TLS carrier socket.

pub mod endpoint;
pub mod listener;
pub mod tls;

pub use endpoint::Endpoint;
pub use listener::Listener;
pub use tls::{ConfirmCert, IoStatus, TlsConnector, TlsSocket, Want};
