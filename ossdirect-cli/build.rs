use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only the cargo instructions; git metadata isn't available when the crate is compiled from
    // crates.io by `cargo install`
    EmitBuilder::builder().all_cargo().emit()?;

    Ok(())
}
