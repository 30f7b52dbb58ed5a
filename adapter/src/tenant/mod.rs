pub mod tenant;

#[cfg(test)]
pub mod memory;
