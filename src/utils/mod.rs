// Utility modules for common functionality
pub mod constants;
pub mod validation;
