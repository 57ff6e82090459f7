// Copyright 2024 Hearth Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! hearth is a single-host HTTP/1.1 server for static site trees, built on a
//! readiness-based reactor: one poll thread, a fixed worker pool for the
//! blocking parse/build/send steps, an asynchronous dual-buffer logger, and a
//! bounded MySQL connection pool backing a small login/registration demo.

pub mod buffer;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod logger;
pub mod server;
pub mod site;
pub mod timer;
pub mod workers;

pub use crate::error::{Error, Result};
