// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Find-first search: the first branch to complete the board cancels all others.

use crate::context::TaskGroupContext;
use crate::error::Exception;
use crate::task::{self, EmptyTask, Task, TaskRef, spawn_root_and_wait};
use crate::test_util::{runtime, trace};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use strand_spin::Mutex;

type Board = [u8; 81];

/// Bits `1..=9` set for every digit that may go into `cell`.
fn free_digits(board: &Board, cell: usize) -> u16 {
    let (row, col) = (cell / 9, cell % 9);
    let (box_row, box_col) = (row / 3 * 3, col / 3 * 3);

    let mut used = 0u16;
    for i in 0..9 {
        used |= 1 << board[row * 9 + i];
        used |= 1 << board[i * 9 + col];
        used |= 1 << board[(box_row + i / 3) * 9 + box_col + i % 3];
    }
    !used & 0b11_1111_1110
}

/// The empty cell with the fewest candidates, `None` once the board is full.
fn most_constrained(board: &Board) -> Option<(usize, u16)> {
    (0..81)
        .filter(|&cell| board[cell] == 0)
        .map(|cell| (cell, free_digits(board, cell)))
        .min_by_key(|(_, free)| free.count_ones())
}

fn is_solution_of(board: &Board, puzzle: &Board) -> bool {
    let givens_kept = puzzle
        .iter()
        .zip(board)
        .all(|(&given, &digit)| given == 0 || given == digit);

    let unit_ok = |cells: &mut dyn Iterator<Item = usize>| {
        let mut seen = 0u16;
        for cell in cells {
            seen |= 1 << board[cell];
        }
        seen == 0b11_1111_1110
    };
    let units_ok = (0..9).all(|i| {
        unit_ok(&mut (0..9).map(|j| i * 9 + j))
            && unit_ok(&mut (0..9).map(|j| j * 9 + i))
            && unit_ok(&mut (0..9).map(|j| (i / 3 * 3 + j / 3) * 9 + i % 3 * 3 + j % 3))
    });

    givens_kept && units_ok
}

/// A board generated from a shifted-row pattern with roughly half its cells blanked.
fn puzzle() -> Board {
    let mut board = [0; 81];
    for row in 0..9 {
        for col in 0..9 {
            if (row * 7 + col * 5 + row * col) % 9 < 4 {
                board[row * 9 + col] = u8::try_from((row * 3 + row / 3 + col) % 9 + 1).unwrap();
            }
        }
    }
    board
}

struct Search {
    board: Board,
    found: Arc<Mutex<Option<Board>>>,
    expanded: Arc<AtomicUsize>,
}

impl Task for Search {
    fn execute(&mut self, this: &TaskRef) -> Result<Option<TaskRef>, Exception> {
        if this.was_cancelled() {
            return Ok(None);
        }
        self.expanded.fetch_add(1, Ordering::Relaxed);

        let Some((cell, free)) = most_constrained(&self.board) else {
            self.found.lock().get_or_insert(self.board);
            this.cancel_task_group();
            return Ok(None);
        };
        if free == 0 {
            return Ok(None);
        }

        let join = this.allocate_continuation(EmptyTask);
        join.set_ref_count(isize::try_from(free.count_ones()).unwrap());
        for digit in 1..=9u8 {
            if free & (1 << digit) != 0 {
                let mut board = self.board;
                board[cell] = digit;
                task::spawn(join.allocate_child(Search {
                    board,
                    found: self.found.clone(),
                    expanded: self.expanded.clone(),
                }));
            }
        }
        Ok(None)
    }
}

fn solve(board: Board) -> (Option<Board>, TaskGroupContext, usize) {
    let found = Arc::new(Mutex::new(None));
    let expanded = Arc::new(AtomicUsize::new(0));
    let ctx = TaskGroupContext::bound();

    let root = TaskRef::allocate_root_with(
        &ctx,
        Search {
            board,
            found: found.clone(),
            expanded: expanded.clone(),
        },
    );
    spawn_root_and_wait(root).unwrap();

    let solution = *found.lock();
    (solution, ctx, expanded.load(Ordering::Relaxed))
}

#[test]
fn finds_a_valid_solution_and_cancels_the_rest() {
    let _trace = trace();
    let (_rt, _guard) = runtime(4);

    let puzzle = puzzle();
    assert!(puzzle.iter().any(|&digit| digit == 0));

    for _ in 0..10 {
        let (solution, ctx, expanded) = solve(puzzle);
        tracing::debug!(expanded, "search finished");

        let solution = solution.expect("puzzle has a solution");
        assert!(is_solution_of(&solution, &puzzle));
        assert!(ctx.was_cancelled());
        assert!(ctx.exception().is_none());
    }
}

#[test]
fn unsolvable_board_terminates_without_cancelling() {
    let _trace = trace();
    let (_rt, _guard) = runtime(2);

    // cell 0 sees every digit: 1..=8 in its row and 9 in its column
    let mut board = [0; 81];
    for col in 1..9 {
        board[col] = u8::try_from(col).unwrap();
    }
    board[9] = 9;

    let (solution, ctx, expanded) = solve(board);
    assert!(solution.is_none());
    assert!(!ctx.was_cancelled());
    assert_eq!(expanded, 1);
}

#[test]
fn full_board_is_its_own_solution() {
    let (_rt, _guard) = runtime(1);

    let mut board = [0; 81];
    for cell in 0..81 {
        let (row, col) = (cell / 9, cell % 9);
        board[cell] = u8::try_from((row * 3 + row / 3 + col) % 9 + 1).unwrap();
    }

    let (solution, ctx, _) = solve(board);
    assert_eq!(solution, Some(board));
    assert!(ctx.was_cancelled());
}
