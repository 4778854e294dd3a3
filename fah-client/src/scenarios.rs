// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Cross-module scenario tests exercising the property-based invariants and
//! end-to-end flows rather than a single module in isolation. Only built
//! under `cfg(test)`, alongside each module's own inline tests.
