/*!

This is the long-form manual for `contest_tally` and `baudit`.

## The Election Information File

The contests of an election are described by a CSV file with one row per
option:

| column | content |
|--------|---------|
| `official_contest_name` | the canonical name of the contest |
| `contest_alias` | other names of the contest, separated by `;` |
| `vote_for` | the number of options a voter may select |
| `official_option` | the canonical name of the option |
| `option_alias` | other names of the option, separated by `;` |

`vote_for` only needs to be filled on one row of the contest. An option
starting with `writein` or `write-in` declares a write-in target: it is not
added to the official options but increments the number of write-in targets
of the contest. On the ballot, these targets are named `writein_0`,
`writein_1`, ...

## Counting policy

For each contest of a ballot, the targets with a mark are counted.

- If the number of marks exceeds `vote_for`, the contest is **overvoted**: every
  target receives 0 votes and the contest receives 1 overvote.
- Otherwise every marked target receives one vote, and the contest receives
  `vote_for - marks` undervotes.

A contest left blank with `vote_for = 2` thus counts 2 undervotes.

## Cast vote record selections

Each selection exported by the voting system for a contest is read as follows:

- empty cells are ignored. A contest with only empty cells is not on the ballot.
  Readers that know a contest was on the ballot and left blank export an
  explicit `undervote` for it instead. The normalized CSV reader does so for
  a row that names a contest with an empty selection.
- `overvote` marks the contest overvoted, and the other selections of the
  contest are ignored.
- `undervote` counts one undervote.
- `write-in:` followed by a name counts one write-in.
- anything else is an option name. The party prefix (`DEM`, `REP`, `REF`,
  `NPA`, `GRN`, `PNF`, `LIB`) and a trailing number between parentheses are
  removed, then the name is compared with the official options and their
  aliases, ignoring the case. Names that match nothing are reported as
  unrecognized selections.

When the contest is present and not overvoted, the undervotes are at least
`vote_for` minus the number of votes.

## Comparing a ballot

The audited reading (from the marks) and the exported reading (from the cast
vote record) of a ballot are both brought to the same form: per contest,
the number of votes of each official option, the number of write-ins, the
overvotes and the undervotes.

The two readings must first agree on which contests are on the ballot. If
they do not, the ballot is reported as `contests_mismatch`, with the contests
found only on one side. Otherwise every contest whose numbers differ is
reported as a disagreement.

## The roismap and the marks tables

The roismap of a style lists the regions of the ballot that hold a target:

`style_num, contest, option, page, sheet0, x, y, w, h, pixel_metric_threshold`

Each contest starts with a header row whose option is `#contest`.

The marks table of a ballot follows the same layout: one `#contest` row per
contest carrying `overvotes` and `undervotes`, followed by one row per target
carrying `has_indication`, `num_marks` and `num_votes`.

*/
