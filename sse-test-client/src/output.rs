use colored::*;

pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub details: Vec<String>,
}

impl TestResult {
    pub fn passed(name: impl Into<String>, details: Vec<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            details,
        }
    }

    pub fn failed(name: impl Into<String>, details: Vec<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            details,
        }
    }
}

pub fn print_test_summary(results: &[TestResult]) {
    for result in results {
        let marker = if result.passed {
            "PASS".green().bold()
        } else {
            "FAIL".red().bold()
        };
        println!("[{}] {}", marker, result.name.bold());
        for detail in &result.details {
            println!("       {}", detail.dimmed());
        }
    }

    let passed = results.iter().filter(|r| r.passed).count();
    println!(
        "\n{} {} passed, {} failed",
        "Summary:".bold(),
        passed.to_string().green(),
        (results.len() - passed).to_string().red()
    );
}
