mod lifecycle_tests;
mod platform_tests;
mod provision_tests;
