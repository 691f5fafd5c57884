use filament::fiber;
use filament::traceback;

fn function_names() -> Vec<String> {
    traceback::frames()
        .iter()
        .map(|f| f.function.to_string())
        .collect()
}

/// The traceback stack follows the fiber across context switches: each
/// fiber only ever sees its own frames.
#[filament::test]
fn traceback_follows_the_fiber() {
    filament::traceback_scope!("main_frame");

    let worker = fiber::start(|| {
        filament::traceback_scope!("fiber_frame");
        fiber::yield_now();
        {
            filament::traceback_scope!("deeper");
            fiber::yield_now();
            function_names()
        }
    });

    let fiber_frames = worker.join().unwrap();
    assert!(fiber_frames.contains(&"fiber_frame".to_string()));
    assert!(fiber_frames.contains(&"deeper".to_string()));
    assert!(!fiber_frames.contains(&"main_frame".to_string()));

    let main_frames = function_names();
    assert!(main_frames.contains(&"main_frame".to_string()));
    assert!(!main_frames.contains(&"fiber_frame".to_string()));
}

#[filament::test]
fn line_tracking() {
    filament::traceback_scope!("lined");
    traceback::set_line(1234);
    let frames = traceback::frames();
    let top = frames.last().unwrap();
    assert_eq!(top.function, "lined");
    assert_eq!(top.line, 1234);
}
