/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

pub(crate) mod events;
pub(crate) mod link;
pub(crate) mod mock_transport;
mod scenarios;

pub(crate) use events::*;
pub(crate) use link::*;
pub(crate) use mock_transport::*;
