//! Integration tests for the filigree watermark engine.

#[cfg(test)]
mod common;
