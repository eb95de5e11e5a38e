use butler::BootstrapConfig;

fn main() {
    let schema = schemars::schema_for!(BootstrapConfig);
    match serde_json::to_string_pretty(&schema) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing config schema: {}", e);
            std::process::exit(1);
        }
    }
}
