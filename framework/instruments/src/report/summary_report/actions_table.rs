use tabled::Tabled;

#[derive(Tabled)]
pub struct ActionRow {
    #[tabled(rename = "Action")]
    pub action: String,
    #[tabled(rename = "Min (sec)", display = "float3_or_na")]
    pub min: Option<f64>,
    #[tabled(rename = "Median (sec)", display = "float3_or_na")]
    pub median: Option<f64>,
    #[tabled(rename = "90%ile (sec)", display = "float3_or_na")]
    pub p90: Option<f64>,
    #[tabled(rename = "95%ile (sec)", display = "float3_or_na")]
    pub p95: Option<f64>,
    #[tabled(rename = "Max (sec)", display = "float3_or_na")]
    pub max: Option<f64>,
    #[tabled(rename = "Avg (sec)", display = "float3_or_na")]
    pub avg: Option<f64>,
    #[tabled(rename = "Success", display = "percent")]
    pub success: f64,
    #[tabled(rename = "Count")]
    pub count: usize,
}

fn float3_or_na(n: &Option<f64>) -> String {
    match n {
        Some(n) => format!("{:.3}", n),
        None => "n/a".to_string(),
    }
}

fn percent(n: &f64) -> String {
    format!("{:.1}%", n)
}
