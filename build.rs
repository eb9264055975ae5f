fn main() {
    let now = time::OffsetDateTime::now_utc();
    let date_fmt = time::format_description::parse("[year]-[month]-[day]")
        .expect("valid date format");
    let time_fmt = time::format_description::parse("[hour]:[minute]:[second]")
        .expect("valid time format");

    let date = std::env::var("WAVEFRONT_BUILD_DATE")
        .unwrap_or_else(|_| now.format(&date_fmt).unwrap_or_else(|_| "unknown".to_string()));
    let time = std::env::var("WAVEFRONT_BUILD_TIME")
        .unwrap_or_else(|_| now.format(&time_fmt).unwrap_or_else(|_| "unknown".to_string()));

    println!("cargo:rerun-if-env-changed=WAVEFRONT_BUILD_DATE");
    println!("cargo:rerun-if-env-changed=WAVEFRONT_BUILD_TIME");
    println!("cargo:rustc-env=WAVEFRONT_BUILD_DATE={}", date);
    println!("cargo:rustc-env=WAVEFRONT_BUILD_TIME={}", time);
}
