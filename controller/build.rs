fn main() {
    // ESP-IDF link arguments are only needed for device builds.
    if std::env::var_os("CARGO_FEATURE_ESP32").is_some() {
        embuild::espidf::sysenv::output();
    }
}
