// SPDX-License-Identifier: GPL-2.0-only
pub mod schema;
pub mod sqlite;
pub mod traits;
