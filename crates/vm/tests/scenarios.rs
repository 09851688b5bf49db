//! End-to-end tests: compile a Pascal source string with `pasc-compiler`,
//! run the resulting chunk to completion, and check captured `WRITE`
//! output. These exercise the full compiler-to-VM pipeline rather than any
//! one opcode in isolation.

use pasc_compiler::Compiler;
use pasc_vm::{SharedBuffer, Vm};

fn run(src: &str) -> String {
    let result = Compiler::compile(src);
    assert!(result.success(), "compile failed: {:?}", result.diagnostics);
    let mut vm = Vm::load(result.chunk.unwrap());
    let buf = SharedBuffer::new();
    vm.set_sink(Box::new(buf.clone()));
    vm.run().unwrap_or_else(|trap| panic!("vm trapped: {trap}"));
    buf.as_string()
}

#[test]
fn arithmetic_with_precedence() {
    assert_eq!(run("program p; begin writeln(2 + 3 * 4) end."), "14\n");
}

#[test]
fn signed_division_truncates_toward_zero() {
    assert_eq!(run("program p; begin writeln(-7 div 2) end."), "-3\n");
}

#[test]
fn for_loop_sums_one_to_ten() {
    let src = "\
program p;
var i, s: integer;
begin
  s := 0;
  for i := 1 to 10 do s := s + i;
  writeln(s)
end.";
    assert_eq!(run(src), "55\n");
}

#[test]
fn short_circuit_and_avoids_division_by_zero() {
    let src = "\
program p;
var i: integer;
begin
  i := 0;
  if (i <> 0) and (10 div i > 0) then
    writeln('bad')
  else
    writeln('ok')
end.";
    assert_eq!(run(src), "ok\n");
}

#[test]
fn record_field_access_through_a_pointer() {
    let src = "\
program p;
type r = record
  a, b: integer
end;
var x: r;
    p: ^r;
begin
  x.a := 1;
  x.b := 2;
  p := @x;
  writeln(p^.a + p^.b)
end.";
    assert_eq!(run(src), "3\n");
}

#[test]
fn forward_declared_subroutine_calls_a_later_sibling() {
    let src = "\
program p;
function f(n: integer): integer; forward;

function g(n: integer): integer;
begin
  g := f(n) + 1
end;

function f(n: integer): integer;
begin
  f := n * 2
end;

begin
  writeln(g(3))
end.";
    assert_eq!(run(src), "7\n");
}
