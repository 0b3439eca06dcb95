fn main() -> std::process::ExitCode {
    evernote_sync_lib::run()
}
