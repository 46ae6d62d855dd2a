fn main() -> anyhow::Result<()> {
    framebench::cli::run()
}
