//! Effective configuration display.

use filexfer::TransferConfig;

pub fn run(config: &TransferConfig) {
    println!("Limits");
    println!("  Max part size:     {}", config.limits.max_part_size);
    println!("  Max part count:    {}", config.limits.max_part_count);
    println!("  Max file size:     {}", config.limits.max_file_size());
    println!();
    println!("Download");
    println!("  Resource limit:    {}", config.download.resource_limit);
    println!("  Mode:              {:?}", config.download.mode);
    println!("  Small file below:  {}", config.download.small_file_threshold);
    println!();
    println!("Upload");
    println!("  Resource limit:    {}", config.upload.resource_limit);
    println!("  Mode:              {:?}", config.upload.mode);
    println!("  Ordered dispatch:  {}", config.upload.ordered_dispatch);
    println!("  Big file above:    {}", config.upload.big_file_threshold);
    println!();
    println!("Retry");
    println!("  Max attempts:      {}", config.retry.max_attempts());
    println!("  CDN refresh limit: {}", config.cdn_token_refresh_limit);
    println!();
    println!("Paths");
    println!("  Temp:              {}", config.temp_dir.display());
    println!("  Files:             {}", config.files_dir.display());
}
