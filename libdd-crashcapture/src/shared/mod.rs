// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! This module holds constants/structures that are shared between the capture path and the
//! setup and read paths.

pub(crate) mod configuration;
pub(crate) mod constants;
pub(crate) mod fixed_string;
pub(crate) mod log;
pub(crate) mod raw_io;
