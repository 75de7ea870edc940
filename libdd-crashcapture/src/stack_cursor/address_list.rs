// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Walks a pre-captured list of return addresses.
#[derive(Debug, Clone)]
pub(crate) struct AddressListWalker<'a> {
    addresses: &'a [usize],
    skip: usize,
}

impl<'a> AddressListWalker<'a> {
    pub(crate) fn new(addresses: &'a [usize], skip: usize) -> Self {
        Self { addresses, skip }
    }

    /// Address of frame `depth`.
    ///
    /// Some unwinders terminate their output with a spurious `0x1`; iteration ends at the first
    /// address that is not a plausible code address.
    pub(crate) fn address_at(&self, depth: usize) -> Option<usize> {
        let end = self.addresses.len().saturating_sub(self.skip);
        if depth >= end {
            return None;
        }
        let address = self.addresses[depth + self.skip];
        (address > 1).then_some(address)
    }
}
