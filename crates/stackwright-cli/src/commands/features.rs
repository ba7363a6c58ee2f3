use super::{json_pretty, EXIT_SUCCESS};
use stackwright_schema::{categories, CATEGORY_PREFIX, FEATURES};

pub fn run(json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "features": FEATURES,
            "categories": categories(),
        });
        println!("{}", json_pretty(&json)?);
        return Ok(EXIT_SUCCESS);
    }

    let width = FEATURES.iter().map(|f| f.id.len()).max().unwrap_or(0);
    println!("Optional features (exclude with `exclude_features` in the config):\n");
    for category in categories() {
        println!("{CATEGORY_PREFIX}{category}");
        for feature in FEATURES.iter().filter(|f| f.category == category) {
            println!("  {:<width$}  {}", feature.id, feature.description);
        }
    }
    Ok(EXIT_SUCCESS)
}
