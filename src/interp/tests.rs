use super::*;
use crate::host::TestHost;
use crate::workspace::{MIN_SIZE, MODE7_FB};

use std::cell::RefCell;
use std::rc::Rc;

fn interp_with(input: Vec<&str>) -> (Interpreter, Rc<RefCell<String>>, Rc<RefCell<bool>>) {
    let (host, output, escape) = TestHost::new(input);
    let ip = Interpreter::new(MIN_SIZE, host).unwrap();
    (ip, output, escape)
}

fn feed(ip: &mut Interpreter, line: &str) {
    ip.process_line(line)
        .unwrap_or_else(|e| panic!("'{line}' failed: {e}"));
}

/// Store the lines, RUN, and return everything printed.
fn run_program(lines: &[&str]) -> (Interpreter, String) {
    let (mut ip, out, _) = interp_with(vec![]);
    for line in lines {
        feed(&mut ip, line);
    }
    feed(&mut ip, "RUN");
    let text = out.borrow().clone();
    (ip, text)
}

fn listing(ip: &Interpreter) -> Vec<String> {
    program::line_offsets(&ip.ws)
        .unwrap()
        .into_iter()
        .map(|off| {
            let n = program::line_number(&ip.ws, off).unwrap();
            let payload = ip
                .ws
                .bytes(program::payload_range(&ip.ws, off).unwrap())
                .unwrap();
            tokens::normalise(Some(n), payload).unwrap()
        })
        .collect()
}

#[test]
fn compound_assignment_on_static_integer() {
    let (ip, text) = run_program(&["10 A%=5 : A%+=3 : PRINT A%"]);
    assert_eq!(text.trim(), "8");
    assert!(ip.stack.is_safe());
    assert!(ip.ws.partition_ok());
}

#[test]
fn array_comma_list_fills_left_to_right() {
    let (ip, text) = run_program(&[
        "10 DIM a(3)",
        "20 a()=1,2,3,4",
        "30 PRINT a(0);a(1);a(2);a(3)",
    ]);
    let fields: Vec<&str> = text.split_whitespace().collect();
    assert_eq!(fields, vec!["1", "2", "3", "4"]);
    assert!(ip.stack.is_safe());
}

#[test]
fn array_comma_list_overflow_reports_the_index() {
    let (mut ip, _, _) = interp_with(vec![]);
    feed(&mut ip, "10 DIM a(1)");
    feed(&mut ip, "20 a()=1,2,3");
    let err = ip.process_line("RUN").unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadIndex);
    assert_eq!(err.val, Some(2));
}

#[test]
fn left_dollar_assignment_overwrites_in_place() {
    let (_, text) = run_program(&["10 A$=\"hello\" : LEFT$(A$,3)=\"HEY\" : PRINT A$"]);
    assert_eq!(text.trim(), "HEYlo");
}

#[test]
fn mid_dollar_assignment_overwrites_in_place() {
    let (_, text) = run_program(&["10 A$=\"abc\" : MID$(A$,2,1)=\"X\" : PRINT A$"]);
    assert_eq!(text.trim(), "aXc");
}

#[test]
fn right_dollar_assignment_writes_the_tail() {
    let (_, text) = run_program(&["10 A$=\"hello\" : RIGHT$(A$,2)=\"YO\" : PRINT A$"]);
    assert_eq!(text.trim(), "helYO");
}

#[test]
fn at_format_word_drives_print() {
    let (_, text) = run_program(&["10 @%=\"F6.2\" : PRINT 3.14159"]);
    assert_eq!(text.trim_end_matches('\n'), "  3.14");
}

#[test]
fn bad_at_format_string_is_ignored() {
    let (mut ip, _, _) = interp_with(vec![]);
    feed(&mut ip, "@%=\"F6.2\"");
    let word = ip.vars.statics[AT_PERCENT];
    feed(&mut ip, "@%=\"Q99\"");
    assert_eq!(ip.vars.statics[AT_PERCENT], word);
}

#[test]
fn renumber_rewrites_goto_targets() {
    let (mut ip, _, _) = interp_with(vec![]);
    feed(&mut ip, "10 GOTO 20");
    feed(&mut ip, "20 PRINT \"x\"");
    feed(&mut ip, "RENUMBER 100,100");
    assert_eq!(listing(&ip), vec!["100 GOTO 200", "200 PRINT \"x\""]);
}

#[test]
fn himem_cannot_move_inside_a_function() {
    let (mut ip, _, _) = interp_with(vec![]);
    let himem = ip.ws.himem;
    for line in [
        "10 X = FNbad",
        "20 END",
        "30 DEF FNbad",
        "40 HIMEM = HIMEM - 1024",
        "50 = 1",
    ] {
        feed(&mut ip, line);
    }
    let err = ip.process_line("RUN").unwrap_err();
    assert_eq!(err.kind, ErrorKind::HimemFixed);
    assert_eq!(ip.ws.himem, himem);
}

#[test]
fn int64_literal_out_of_int32_range_raises_range() {
    let (mut ip, _, _) = interp_with(vec![]);
    let err = ip.process_line("A% = &FFFFFFFFFFFF").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Range);
}

#[test]
fn array_shape_mismatch_raises_typearray() {
    let (mut ip, _, _) = interp_with(vec![]);
    feed(&mut ip, "DIM a(5)");
    feed(&mut ip, "DIM b(6)");
    let err = ip.process_line("a()=b()").unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeArray);
}

#[test]
fn array_copy_and_elementwise_arithmetic() {
    let (_, text) = run_program(&[
        "10 DIM a(2) : DIM b(2)",
        "20 b()=10,20,30",
        "30 a()=b()",
        "40 a()+=1",
        "50 PRINT a(0);a(1);a(2)",
    ]);
    let fields: Vec<&str> = text.split_whitespace().collect();
    assert_eq!(fields, vec!["11", "21", "31"]);
}

#[test]
fn array_expression_makes_a_temporary() {
    let (_, text) = run_program(&[
        "10 DIM a(2) : DIM b(2)",
        "20 a()=1,2,3 : b()=10,20,30",
        "30 DIM c(2)",
        "40 c()=a()+b()",
        "50 PRINT c(0);c(1);c(2);SUM c()",
    ]);
    let fields: Vec<&str> = text.split_whitespace().collect();
    assert_eq!(fields, vec!["11", "22", "33", "66"]);
}

#[test]
fn scalar_fill_broadcasts() {
    let (_, text) = run_program(&["10 DIM a(2) : a()=7 : PRINT a(0);a(1);a(2)"]);
    assert_eq!(text.split_whitespace().collect::<Vec<_>>(), vec!["7", "7", "7"]);
}

#[test]
fn string_minus_assign_is_rejected() {
    let (mut ip, _, _) = interp_with(vec![]);
    feed(&mut ip, "A$=\"x\"");
    let err = ip.process_line("A$-=\"y\"").unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadArith);
    let err = ip.process_line("A$ AND=\"y\"").unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadBitwise);
}

#[test]
fn string_append_and_self_assignment() {
    let (_, text) = run_program(&[
        "10 A$=\"ab\"",
        "20 A$+=\"cd\"",
        "30 A$=A$",
        "40 PRINT A$;LEN A$",
    ]);
    assert_eq!(text.trim(), "abcd4");
}

#[test]
fn for_next_loop_accumulates() {
    let (_, text) = run_program(&["10 T%=0 : FOR I%=1 TO 5 : T%+=I% : NEXT : PRINT T%"]);
    assert_eq!(text.trim(), "15");
}

#[test]
fn for_loop_with_negative_step() {
    let (_, text) = run_program(&[
        "10 FOR I%=3 TO 1 STEP -1",
        "20 PRINT I%;",
        "30 NEXT I%",
    ]);
    assert_eq!(text.split_whitespace().collect::<Vec<_>>(), vec!["3", "2", "1"]);
}

#[test]
fn repeat_until_and_while_loops() {
    let (_, text) = run_program(&[
        "10 I%=0 : REPEAT : I%+=1 : UNTIL I%=4 : PRINT I%",
        "20 J%=0 : WHILE J%<3 : J%+=1 : ENDWHILE : PRINT J%",
    ]);
    assert_eq!(text.split_whitespace().collect::<Vec<_>>(), vec!["4", "3"]);
}

#[test]
fn while_with_false_condition_skips_body() {
    let (_, text) = run_program(&[
        "10 WHILE FALSE",
        "20 PRINT \"never\"",
        "30 ENDWHILE",
        "40 PRINT \"done\"",
    ]);
    assert_eq!(text.trim(), "done");
}

#[test]
fn gosub_return_round_trip() {
    let (_, text) = run_program(&[
        "10 GOSUB 100",
        "20 PRINT \"after\"",
        "30 END",
        "100 PRINT \"sub\"",
        "110 RETURN",
    ]);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, vec!["sub", "after"]);
}

#[test]
fn if_then_else_single_line() {
    let (_, text) = run_program(&[
        "10 A%=5",
        "20 IF A%>3 THEN PRINT \"big\" ELSE PRINT \"small\"",
        "30 IF A%>9 THEN PRINT \"big\" ELSE PRINT \"small\"",
    ]);
    assert_eq!(text.lines().collect::<Vec<_>>(), vec!["big", "small"]);
}

#[test]
fn on_goto_selects_by_index() {
    let (_, text) = run_program(&[
        "10 N%=2",
        "20 ON N% GOTO 100,200,300",
        "100 PRINT \"one\" : END",
        "200 PRINT \"two\" : END",
        "300 PRINT \"three\" : END",
    ]);
    assert_eq!(text.trim(), "two");
}

#[test]
fn on_out_of_range_raises_onrange() {
    let (mut ip, _, _) = interp_with(vec![]);
    feed(&mut ip, "10 ON 7 GOTO 100,200");
    feed(&mut ip, "100 END");
    feed(&mut ip, "200 END");
    let err = ip.process_line("RUN").unwrap_err();
    assert_eq!(err.kind, ErrorKind::OnRange);
}

#[test]
fn proc_with_value_and_return_parameters() {
    let (_, text) = run_program(&[
        "10 X% = 3",
        "20 PROCdouble(X%)",
        "30 PRINT X%",
        "40 PROCgreet(\"world\")",
        "50 END",
        "60 DEF PROCdouble(RETURN v%)",
        "70 v% = v% * 2",
        "80 ENDPROC",
        "90 DEF PROCgreet(who$)",
        "100 PRINT \"hello \";who$",
        "110 ENDPROC",
    ]);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, vec!["6", "hello world"]);
}

#[test]
fn fn_call_returns_a_value() {
    let (_, text) = run_program(&[
        "10 PRINT FNsq(3) + FNsq(4)",
        "20 END",
        "30 DEF FNsq(x) = x*x",
    ]);
    assert_eq!(text.trim(), "25");
}

#[test]
fn local_variables_are_restored() {
    let (_, text) = run_program(&[
        "10 A%=1",
        "20 PROCshadow",
        "30 PRINT A%",
        "40 END",
        "50 DEF PROCshadow",
        "60 LOCAL t",
        "70 t = 99",
        "80 ENDPROC",
    ]);
    assert_eq!(text.trim(), "1");
}

#[test]
fn read_data_restore() {
    let (_, text) = run_program(&[
        "10 READ A$, B%",
        "20 PRINT A$;B%",
        "30 RESTORE",
        "40 READ C$",
        "50 PRINT C$",
        "60 END",
        "70 DATA hello, 42",
    ]);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0].trim(), "hello42");
    assert_eq!(lines[1], "hello");
}

#[test]
fn out_of_data_raises() {
    let (mut ip, _, _) = interp_with(vec![]);
    feed(&mut ip, "10 READ A$ : READ B$");
    feed(&mut ip, "20 DATA only");
    let err = ip.process_line("RUN").unwrap_err();
    assert_eq!(err.kind, ErrorKind::OutOfData);
}

#[test]
fn on_error_handler_catches_and_reports() {
    let (_, text) = run_program(&[
        "10 ON ERROR PRINT \"caught \";ERR : END",
        "20 PRINT 1/0",
        "30 PRINT \"unreachable\"",
    ]);
    assert_eq!(text.trim(), "caught 18");
}

#[test]
fn error_statement_raises_user_error() {
    let (_, text) = run_program(&[
        "10 ON ERROR PRINT REPORT$;\" (\";ERR;\")\" : END",
        "20 ERROR 99, \"custom failure\"",
    ]);
    assert!(text.contains("custom failure"));
    assert!(text.contains("99"));
}

#[test]
fn untrapped_error_reports_the_line() {
    let (mut ip, _, _) = interp_with(vec![]);
    feed(&mut ip, "10 PRINT 1");
    feed(&mut ip, "20 PRINT 1/0");
    let err = ip.process_line("RUN").unwrap_err();
    assert_eq!(err.kind, ErrorKind::DivZero);
    assert_eq!(err.line, 20);
    assert_eq!(err.report(), "Division by zero at line 20");
}

#[test]
fn escape_flag_interrupts_a_running_program() {
    let (mut ip, _, escape) = interp_with(vec![]);
    feed(&mut ip, "10 I%=0");
    feed(&mut ip, "20 I%+=1");
    feed(&mut ip, "30 IF I%=10 THEN 40 ELSE 20");
    feed(&mut ip, "40 END");
    *escape.borrow_mut() = true;
    let err = ip.process_line("RUN").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Escape);
}

#[test]
fn indirection_reads_and_writes() {
    let (mut ip, out, _) = interp_with(vec![]);
    feed(&mut ip, "!&9000 = 123456");
    feed(&mut ip, "?&9010 = 200");
    feed(&mut ip, "$&9020 = \"HI\"");
    feed(&mut ip, "|&9030 = 2.5");
    feed(&mut ip, "]&9040 = 12345678901");
    feed(&mut ip, "PRINT !&9000;?&9010;$&9020;|&9030;]&9040");
    let text = out.borrow().clone();
    assert!(text.contains("123456"));
    assert!(text.contains("200"));
    assert!(text.contains("HI"));
    assert!(text.contains("2.5"));
    assert!(text.contains("12345678901"));
    // The CR terminator of the $ write.
    assert_eq!(ip.ws.read_byte(0x9022).unwrap(), 0x0D);
}

#[test]
fn dollar_append_relocates_the_terminator() {
    let (mut ip, out, _) = interp_with(vec![]);
    feed(&mut ip, "$&9100 = \"AB\"");
    feed(&mut ip, "$&9100 += \"CD\"");
    feed(&mut ip, "PRINT $&9100");
    assert!(out.borrow().contains("ABCD"));
    assert_eq!(ip.ws.read_byte(0x9104).unwrap(), 0x0D);
}

#[test]
fn mode7_window_writes_notify_the_screen() {
    let parts = TestHost::full(vec![]);
    let mode7 = Rc::clone(&parts.mode7_rows);
    let mut ip = Interpreter::new(MIN_SIZE, parts.host).unwrap();
    feed(&mut ip, &format!("?{} = 65", MODE7_FB));
    feed(&mut ip, &format!("?{} = 66", MODE7_FB + 41));
    assert_eq!(&*mode7.borrow(), &[0, 1]);
}

#[test]
fn dim_byte_block_allocates_in_the_heap() {
    let (mut ip, _, _) = interp_with(vec![]);
    let vartop = ip.ws.vartop;
    feed(&mut ip, "DIM P% 100");
    assert!(ip.ws.vartop >= vartop + 100);
    assert!(ip.vars.statics[15] as usize >= vartop);
    feed(&mut ip, "?P% = 7");
    assert!(ip.ws.partition_ok());
}

#[test]
fn lomem_move_clears_variables() {
    let (mut ip, _, _) = interp_with(vec![]);
    feed(&mut ip, "X = 5");
    assert!(ip.vars.lookup("X").is_some());
    let new_lomem = ip.ws.top + 4096;
    feed(&mut ip, &format!("LOMEM = {new_lomem}"));
    assert!(ip.vars.lookup("X").is_none());
    assert_eq!(ip.ws.lomem, crate::workspace::align_up(new_lomem));
}

#[test]
fn himem_move_requires_an_empty_stack() {
    let (mut ip, _, _) = interp_with(vec![]);
    let himem = ip.ws.himem;
    feed(&mut ip, &format!("HIMEM = {}", himem - 8192));
    assert_eq!(ip.ws.himem, himem - 8192);
}

#[test]
fn page_move_implies_new() {
    let (mut ip, _, _) = interp_with(vec![]);
    feed(&mut ip, "10 PRINT 1");
    let new_page = ip.ws.page + 4096;
    feed(&mut ip, &format!("PAGE = {new_page}"));
    assert_eq!(ip.ws.page, crate::workspace::align_up(new_page));
    assert_eq!(listing(&ip), Vec::<String>::new());
}

#[test]
fn out_of_range_himem_is_a_warning_not_an_error() {
    let (mut ip, out, _) = interp_with(vec![]);
    let himem = ip.ws.himem;
    feed(&mut ip, "HIMEM = 10");
    assert_eq!(ip.ws.himem, himem);
    assert!(out.borrow().contains("HIMEM setting ignored"));
}

#[test]
fn stack_is_empty_at_statement_boundaries() {
    let (mut ip, _, _) = interp_with(vec![]);
    for line in [
        "A% = 1 + 2 * 3",
        "B$ = \"x\" + \"y\"",
        "PRINT A%;B$",
        "DIM q(4) : q() = 1",
    ] {
        feed(&mut ip, line);
        assert!(ip.stack.is_safe(), "stack not empty after '{line}'");
    }
}

#[test]
fn immediate_loop_on_one_line() {
    let (mut ip, out, _) = interp_with(vec![]);
    feed(&mut ip, "FOR I%=1 TO 3 : PRINT I%; : NEXT");
    assert_eq!(
        out.borrow().split_whitespace().collect::<Vec<_>>(),
        vec!["1", "2", "3"]
    );
}

#[test]
fn goto_from_the_prompt_enters_the_program() {
    let (mut ip, out, _) = interp_with(vec![]);
    feed(&mut ip, "10 PRINT \"here\"");
    feed(&mut ip, "20 END");
    feed(&mut ip, "GOTO 10");
    assert_eq!(out.borrow().trim(), "here");
}

#[test]
fn eval_builtin_evaluates_text() {
    let (mut ip, out, _) = interp_with(vec![]);
    feed(&mut ip, "PRINT EVAL(\"2*3+1\")");
    assert_eq!(out.borrow().trim(), "7");
}

#[test]
fn swap_exchanges_values_of_like_type() {
    let (mut ip, out, _) = interp_with(vec![]);
    feed(&mut ip, "A%=1 : B%=2 : SWAP A%,B% : PRINT A%;B%");
    assert_eq!(out.borrow().split_whitespace().collect::<Vec<_>>(), vec!["2", "1"]);
    let err = ip.process_line("A$=\"x\" : SWAP A$,B%").unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoSwap);
}

#[test]
fn library_install_dispatches_proc_calls() {
    let dir = std::env::temp_dir().join(format!("brandy_lib_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let lib = dir.join("shout.bas");
    std::fs::write(
        &lib,
        "10 DEF PROCshout(msg$)\n20 PRINT msg$;\"!\"\n30 ENDPROC\n",
    )
    .unwrap();

    let (mut ip, out, _) = interp_with(vec![]);
    feed(&mut ip, &format!("INSTALL \"{}\"", lib.display()));
    feed(&mut ip, "10 PROCshout(\"hey\")");
    feed(&mut ip, "RUN");
    assert_eq!(out.borrow().trim(), "hey!");

    std::fs::remove_file(&lib).unwrap();
    let _ = std::fs::remove_dir(&dir);
}

#[test]
fn save_and_load_round_trip_as_text() {
    let path = std::env::temp_dir().join(format!("brandy_prog_{}.bas", std::process::id()));
    let name = path.to_string_lossy().into_owned();

    let (mut ip, _, _) = interp_with(vec![]);
    feed(&mut ip, "10 PRINT \"one\"");
    feed(&mut ip, "20 GOTO 10");
    feed(&mut ip, &format!("SAVE \"{name}\""));
    let saved = std::fs::read_to_string(&path).unwrap();
    assert_eq!(saved, "10 PRINT \"one\"\n20 GOTO 10\n");

    let (mut ip2, _, _) = interp_with(vec![]);
    feed(&mut ip2, &format!("LOAD \"{name}\""));
    assert_eq!(listing(&ip2), vec!["10 PRINT \"one\"", "20 GOTO 10"]);
    assert_eq!(ip2.last_name.as_deref(), Some(name.as_str()));

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn list_paging_honours_the_more_prompt() {
    let parts = TestHost::full(vec![]);
    let keys = Rc::clone(&parts.keys);
    let output = Rc::clone(&parts.output);
    let mut ip = Interpreter::new(MIN_SIZE, parts.host).unwrap();
    for i in 1..=25 {
        feed(&mut ip, &format!("{} PRINT {}", i * 10, i));
    }
    // Escape at the first pause.
    keys.borrow_mut().push(27);
    feed(&mut ip, "LISTO 32");
    feed(&mut ip, "LIST");
    let text = output.borrow().clone();
    assert!(text.contains("-- More --"));
    assert!(text.contains("200 PRINT 20"));
    assert!(!text.contains("210 PRINT 21"));
}

#[test]
fn edit_line_retokenises_the_result() {
    let (mut ip, _, _) = interp_with(vec!["PRINT 2"]);
    feed(&mut ip, "10 PRINT 1");
    // EDIT 10 prefills "10 PRINT 1"; the scripted keyboard appends.
    let err = ip.process_line("EDIT 10").unwrap_err();
    assert_eq!(err.kind, ErrorKind::None);
    assert_eq!(listing(&ip), vec!["10 PRINT 1PRINT 2"]);
}

#[test]
fn deleted_number_during_edit_executes_immediately() {
    let parts = TestHost::full(vec![]);
    let output = Rc::clone(&parts.output);
    let mut ip = Interpreter::new(MIN_SIZE, parts.host).unwrap();
    feed(&mut ip, "PRINT \"go\"");
    assert_eq!(output.borrow().trim(), "go");
}

#[test]
fn quit_statement_leaves_the_loop() {
    let (mut ip, _, _) = interp_with(vec![]);
    assert_eq!(ip.process_line("QUIT").unwrap(), Outcome::Quit);
}

#[test]
fn division_by_zero_in_div_and_mod() {
    let (mut ip, _, _) = interp_with(vec![]);
    assert_eq!(
        ip.process_line("PRINT 1 DIV 0").unwrap_err().kind,
        ErrorKind::DivZero
    );
    assert_eq!(
        ip.process_line("A% = 1 : A% MOD= 0").unwrap_err().kind,
        ErrorKind::DivZero
    );
}

#[test]
fn float_bitwise_assignment_goes_through_int64() {
    let (mut ip, out, _) = interp_with(vec![]);
    feed(&mut ip, "f = 6.7");
    feed(&mut ip, "f AND= 3");
    feed(&mut ip, "PRINT f");
    // 6.7 rounds to 7; 7 AND 3 = 3, converted back to float.
    assert_eq!(out.borrow().trim(), "3");
}

#[test]
fn uint8_arithmetic_wraps() {
    let (mut ip, out, _) = interp_with(vec![]);
    feed(&mut ip, "b& = 250");
    feed(&mut ip, "b& += 10");
    feed(&mut ip, "PRINT b&");
    assert_eq!(out.borrow().trim(), "4");
}

#[test]
fn int64_suffix_holds_wide_values() {
    let (mut ip, out, _) = interp_with(vec![]);
    feed(&mut ip, "w%% = &FFFFFFFFFFFF");
    feed(&mut ip, "PRINT w%%");
    assert_eq!(out.borrow().trim(), "281474976710655");
}

#[test]
fn report_prints_the_last_error() {
    let (mut ip, out, _) = interp_with(vec![]);
    let err = ip.process_line("PRINT 1/0").unwrap_err();
    ip.error_slot = Some(err);
    feed(&mut ip, "REPORT");
    assert!(out.borrow().contains("Division by zero"));
}
