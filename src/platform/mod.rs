// ABOUTME: Chat transport implementations for the gateway
// ABOUTME: Matrix (with bridged phone contacts) is the only network wired today

pub mod matrix;

pub use matrix::MatrixTransport;
