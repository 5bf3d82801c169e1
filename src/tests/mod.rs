//! Cross-module scenario tests for the autonomous cycle.


#[cfg(test)]
mod test_helpers;
