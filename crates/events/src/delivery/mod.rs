//! External delivery channels for run notifications.

pub mod webhook;
