// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! This module holds constants/structures that are shared between the
//! recording engine and the post-capture side.

pub mod configuration;
pub mod constants;
pub mod log;
pub mod timeout;
