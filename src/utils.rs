// Copyright 2020 Joyent, Inc.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A panicking service must not take the conversation tables down with it,
// so poisoned locks are entered anyway.

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn default_logger(log: Option<&slog::Logger>) -> slog::Logger {
    use slog::Drain;
    log.cloned()
        .unwrap_or_else(|| slog::Logger::root(slog_stdlog::StdLog.fuse(), slog::o!()))
}
