// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(test)]
pub trait TestInstance {
    fn test_instance(seed: u64) -> Self;
}

/// Serializes the tests that touch process-wide state: the installed engine
/// and the published user context.
#[cfg(test)]
pub(crate) static PROCESS_STATE: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) fn lock_process_state() -> std::sync::MutexGuard<'static, ()> {
    PROCESS_STATE
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
